use clap::{Parser, ValueEnum};

/// Command-line arguments for the `roxy` proxy process.
///
/// Mirrors the teacher's `RoxyArgs` (a thin `clap`-derived struct) but scoped
/// to the headless proxy surface: listening port and outbound TLS posture.
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct RoxyArgs {
    /// Port the proxy listens on.
    #[arg(short, long, env = "PORT", default_value_t = 9090)]
    pub port: u16,

    /// Outbound TLS transport: `native` speaks TLS directly, `fingerprint`
    /// routes through a sidecar that mimics a browser's TLS fingerprint.
    #[arg(short = 't', long, value_enum, default_value_t = TlsProvider::Native)]
    pub tls_provider: TlsProvider,

    /// Fingerprint profile passed to the sidecar when `--tls-provider fingerprint`.
    #[arg(short = 'f', long, env = "TLS_PROFILE", default_value = "electron")]
    pub tls_fingerprint: String,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsProvider {
    Native,
    Fingerprint,
}
