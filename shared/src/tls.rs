use std::sync::Arc;

use rustls::{
    ClientConfig, ServerConfig, SupportedCipherSuite,
    crypto::CryptoProvider,
    sign::CertifiedKey,
    version::{TLS12, TLS13},
};

use crate::{
    cert::{LoggingResolvesServerCert, LoggingServerVerifier},
    crypto::init_crypto,
};

#[derive(Debug, Clone)]
pub struct TlsConfig {
    crypto_provider: Arc<CryptoProvider>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        init_crypto();
        let provider = rustls::crypto::aws_lc_rs::default_provider();
        TlsConfig::from_provider(provider)
    }
}

pub struct RustlsClientConfig {
    pub cert_logger: Arc<LoggingServerVerifier>,
    pub client_config: ClientConfig,
}

pub struct RustlsServerConfig {
    pub resolver: Arc<LoggingResolvesServerCert>,
    pub server_config: ServerConfig,
}

impl TlsConfig {
    pub fn from_provider(provider: CryptoProvider) -> Self {
        let crypto_provider = CryptoProvider {
            cipher_suites: provider.cipher_suites.clone(),
            kx_groups: provider.kx_groups.clone(),
            signature_verification_algorithms: provider.signature_verification_algorithms,
            secure_random: provider.secure_random,
            key_provider: provider.key_provider,
        };
        Self {
            crypto_provider: Arc::new(crypto_provider),
        }
    }

    pub fn crypto_provider(&self) -> Arc<CryptoProvider> {
        self.crypto_provider.clone()
    }

    /// Client config for the Native origin transport: hostname/chain verification
    /// is disabled by policy (see DESIGN.md Open Question: "origin TLS
    /// verification by default"), matching agents that themselves skip
    /// certificate checks when run behind a MITM proxy.
    pub fn rustls_client_config_insecure(&self) -> RustlsClientConfig {
        let cert_logger = Arc::new(LoggingServerVerifier::new());
        let client_config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(cert_logger.clone())
            .with_no_client_auth();
        RustlsClientConfig {
            cert_logger,
            client_config,
        }
    }

    pub fn rustls_server_config(
        &self,
        certified_key: CertifiedKey,
    ) -> Result<RustlsServerConfig, Box<dyn std::error::Error>> {
        let versions = self
            .crypto_provider
            .cipher_suites
            .iter()
            .map(|cs| match cs {
                SupportedCipherSuite::Tls12(_) => &TLS12,
                SupportedCipherSuite::Tls13(_) => &TLS13,
            })
            .collect::<Vec<_>>();
        let resolver = Arc::new(LoggingResolvesServerCert::new(certified_key));
        let server_config = ServerConfig::builder_with_provider(self.crypto_provider.clone())
            .with_protocol_versions(versions.as_slice())?
            .with_no_client_auth()
            .with_cert_resolver(resolver.clone());

        Ok(RustlsServerConfig {
            resolver,
            server_config,
        })
    }
}
