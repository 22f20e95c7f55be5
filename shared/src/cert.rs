use bytes::Bytes;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use std::sync::{Arc, Mutex};

use crate::alpn::AlpnProtocol;
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::ServerName;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{
    ProtocolVersion, RootCertStore, ServerConnection, SignatureScheme, SupportedCipherSuite,
    pki_types::*,
};
use tracing::trace;

#[derive(Debug, Default, Clone)]
pub struct ServerVerificationCapture {
    pub cert: Option<VerifyServerCert>,
    pub tls: TlsVerify,
}

#[derive(Debug, Clone)]
pub struct VerifyServerCert {
    pub end_entity: Bytes,
    pub intermediates: Vec<Bytes>,
    pub server_name: ServerName<'static>,
    pub ocsp_response: Bytes,
    pub now: UnixTime,
    pub error: Option<rustls::Error>,
}

#[derive(Debug, Clone, Default)]
pub enum TlsVerify {
    Tls13(TlsCapture),
    Tls12(TlsCapture),
    #[default]
    None,
}

#[derive(Debug, Clone)]
pub struct TlsCapture {
    pub message: Bytes,
    pub cert: Bytes,
    pub dss: rustls::DigitallySignedStruct,
    pub error: Option<rustls::Error>,
}

/// TLS session metadata captured off an accepted `ServerConnection`, surfaced on the
/// `Flow` as `tls_metadata` for HTTPS flows.
#[derive(Default, Debug, Clone)]
pub struct ServerTlsConnectionData {
    pub protocol_version: Option<ProtocolVersion>,
    pub cipher_suite: Option<SupportedCipherSuite>,
    pub sni: Option<String>,
    pub key_exchange_group: Option<String>,
    pub alpn: AlpnProtocol,
}

impl From<&ServerConnection> for ServerTlsConnectionData {
    fn from(tls_session: &ServerConnection) -> Self {
        ServerTlsConnectionData {
            protocol_version: tls_session.protocol_version(),
            cipher_suite: tls_session.negotiated_cipher_suite(),
            sni: tls_session.server_name().map(String::from),
            key_exchange_group: tls_session
                .negotiated_key_exchange_group()
                .map(|v| format!("{v:?}")),
            alpn: AlpnProtocol::from_bytes_opt(tls_session.alpn_protocol()),
        }
    }
}

/// Origin-facing `ServerCertVerifier`. With `inner = None` it accepts every
/// certificate unconditionally — this realizes the "hostname verification
/// disabled by policy" behavior the Native origin transport is required to use.
/// With an inner `WebPkiServerVerifier` installed it verifies normally; nothing
/// in this workspace constructs that variant today, but it's kept so a future
/// opt-in strict mode doesn't need a new verifier type.
#[derive(Debug)]
pub struct LoggingServerVerifier {
    pub certs: std::sync::Mutex<ServerVerificationCapture>,
    inner: Option<Arc<WebPkiServerVerifier>>,
}

impl LoggingServerVerifier {
    pub fn new() -> Self {
        LoggingServerVerifier {
            certs: std::sync::Mutex::new(ServerVerificationCapture::default()),
            inner: None,
        }
    }

    pub fn with_root_store_provider(
        root_store: Arc<RootCertStore>,
        crypto_provider: Arc<CryptoProvider>,
    ) -> Self {
        let inner = WebPkiServerVerifier::builder_with_provider(root_store, crypto_provider)
            .build()
            .map(Some)
            .unwrap_or(None);
        LoggingServerVerifier {
            certs: std::sync::Mutex::new(ServerVerificationCapture::default()),
            inner,
        }
    }
}

impl Default for LoggingServerVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerCertVerifier for LoggingServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        trace!("verifying origin certificate for {:?}", server_name);

        let res = self
            .inner
            .as_ref()
            .map(|v| {
                v.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
            })
            .unwrap_or(Ok(ServerCertVerified::assertion()));

        if let Ok(mut guard) = self.certs.lock() {
            guard.cert = Some(VerifyServerCert {
                end_entity: end_entity.to_vec().into(),
                intermediates: intermediates.iter().map(|i| i.to_vec().into()).collect(),
                server_name: server_name.to_owned(),
                ocsp_response: ocsp_response.to_vec().into(),
                now,
                error: res.as_ref().err().cloned(),
            });
        }

        res
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        let res = self
            .inner
            .as_ref()
            .map(|v| v.verify_tls12_signature(message, cert, dss))
            .unwrap_or(Ok(HandshakeSignatureValid::assertion()));

        if let Ok(mut guard) = self.certs.lock() {
            guard.tls = TlsVerify::Tls12(TlsCapture {
                message: message.to_vec().into(),
                cert: cert.to_vec().into(),
                dss: dss.clone(),
                error: res.as_ref().err().cloned(),
            });
        }
        res
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        let res = self
            .inner
            .as_ref()
            .map(|v| v.verify_tls13_signature(message, cert, dss))
            .unwrap_or(Ok(HandshakeSignatureValid::assertion()));

        if let Ok(mut guard) = self.certs.lock() {
            guard.tls = TlsVerify::Tls13(TlsCapture {
                message: message.to_vec().into(),
                cert: cert.to_vec().into(),
                dss: dss.clone(),
                error: res.as_ref().err().cloned(),
            });
        }
        res
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner
            .as_ref()
            .map(|f| f.supported_verify_schemes())
            .unwrap_or(vec![
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
            ])
    }
}

#[derive(Debug, Clone)]
pub struct CapturedClientHello {
    pub data: String,
}

impl From<ClientHello<'_>> for CapturedClientHello {
    fn from(value: ClientHello<'_>) -> Self {
        CapturedClientHello {
            data: format!("{value:?}"),
        }
    }
}

/// Always resolves to the leaf `CertifiedKey` it was built with. One instance is
/// built per intercepted CONNECT, after the host's leaf has been signed.
#[derive(Debug)]
pub struct LoggingResolvesServerCert {
    pub client_hello: Arc<Mutex<Option<CapturedClientHello>>>,
    key: Arc<CertifiedKey>,
}

impl LoggingResolvesServerCert {
    pub fn new(key: CertifiedKey) -> Self {
        Self {
            client_hello: Arc::new(Mutex::new(None)),
            key: Arc::new(key),
        }
    }
}

impl ResolvesServerCert for LoggingResolvesServerCert {
    fn resolve(
        &self,
        client_hello: rustls::server::ClientHello<'_>,
    ) -> Option<Arc<rustls::sign::CertifiedKey>> {
        if let Ok(mut guard) = self.client_hello.lock() {
            let _ = guard.insert(client_hello.into());
        }
        Some(self.key.clone())
    }
}
