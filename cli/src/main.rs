use std::{path::Path, sync::Arc};

use clap::Parser;
use roxy_cli::{config::RoxyArgs, logging};
use roxy_proxy::{
    flow::FlowStore,
    http_forward::HttpForwarderConfig,
    origin::OriginTransport,
    supervisor::{self, SupervisorConfig},
};
use roxy_shared::{load_or_create_root, tls::TlsConfig};
use tracing::error;

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let args = RoxyArgs::parse();

    if let Err(e) = logging::initialize_logging() {
        eprintln!("failed to initialize logging: {e}");
        return std::process::ExitCode::from(1);
    }

    let ca = match load_or_create_root(Path::new("./certs")) {
        Ok(ca) => ca,
        Err(e) => {
            error!("failed to load or create root CA: {e}");
            return std::process::ExitCode::from(1);
        }
    };

    let tls_config = TlsConfig::default();
    let flow_store = FlowStore::new();
    let transport = match args.tls_provider {
        roxy_cli::config::TlsProvider::Native => OriginTransport::native(tls_config.clone()),
        roxy_cli::config::TlsProvider::Fingerprint => {
            OriginTransport::fingerprint(args.tls_fingerprint.clone(), tls_config.clone())
        }
    };

    let config = SupervisorConfig {
        port: args.port,
        ca,
        tls_config,
        flow_store,
        transport,
        forwarder_config: HttpForwarderConfig::default(),
        tls_profile: Arc::new(tokio::sync::RwLock::new(args.tls_fingerprint.clone())),
    };

    if let Err(e) = supervisor::run(config).await {
        error!("proxy exited with error: {e}");
        return std::process::ExitCode::from(1);
    }

    std::process::ExitCode::from(0)
}
