use std::sync::Once;

use color_eyre::eyre::Result;
use tracing_error::ErrorLayer;
use tracing_subscriber::{self, Layer, layer::SubscriberExt, util::SubscriberInitExt};

static INIT_TRACING: Once = Once::new();

/// Installs a stderr tracing subscriber, honoring `RUST_LOG`/`ROXY_LOGLEVEL`.
pub fn initialize_logging() -> Result<()> {
    INIT_TRACING.call_once(|| {
        let filter = std::env::var("RUST_LOG")
            .or_else(|_| std::env::var("ROXY_LOGLEVEL"))
            .unwrap_or_else(|_| format!("{}=info", env!("CARGO_CRATE_NAME")));

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_filter(tracing_subscriber::filter::EnvFilter::new(filter));

        tracing_subscriber::registry()
            .with(fmt_layer)
            .with(ErrorLayer::default())
            .init();
    });
    Ok(())
}
