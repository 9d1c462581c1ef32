//! Command-line and environment configuration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Capture relay gateway", long_about = None)]
pub struct Config {
    #[arg(
        long,
        env = "CAPTURE_RELAY_BIND",
        default_value = "127.0.0.1:4000",
        help = "Listen address for WebSocket and HTTP endpoints"
    )]
    pub bind: SocketAddr,

    #[arg(
        long,
        env = "CAPTURE_RELAY_JWKS_URL",
        required_unless_present = "jwks_file",
        conflicts_with = "jwks_file",
        help = "JWKS document used to verify client bearer tokens"
    )]
    pub jwks_url: Option<String>,

    #[arg(
        long,
        value_name = "PATH",
        env = "CAPTURE_RELAY_JWKS_FILE",
        help = "Local JWKS document, used instead of --jwks-url"
    )]
    pub jwks_file: Option<PathBuf>,

    #[arg(long, env = "CAPTURE_RELAY_ISSUER", help = "Required `iss` claim")]
    pub issuer: Option<String>,

    #[arg(
        long,
        env = "CAPTURE_RELAY_AUDIENCE",
        value_delimiter = ',',
        help = "Accepted `aud` values (comma separated)"
    )]
    pub audience: Vec<String>,

    #[arg(
        long,
        env = "CAPTURE_RELAY_JWKS_CACHE_SECS",
        default_value_t = 300,
        help = "How long a fetched key set is reused"
    )]
    pub jwks_cache_secs: u64,

    #[arg(
        long,
        env = "CAPTURE_RELAY_KEEPALIVE_SECS",
        default_value_t = 50,
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Interval between keep-alive probes"
    )]
    pub keepalive_secs: u64,

    #[arg(
        long,
        env = "CAPTURE_RELAY_DISPATCH_TOKEN",
        hide_env_values = true,
        help = "Service token enabling POST /api/users/{id}/commands"
    )]
    pub dispatch_token: Option<String>,

    #[arg(
        long,
        env = "CAPTURE_RELAY_HANDLER_URL",
        help = "Forward client messages to this URL; replies are sent back"
    )]
    pub handler_url: Option<String>,

    #[arg(
        long,
        value_name = "PATH",
        env = "CAPTURE_RELAY_TLS_CERT",
        requires = "tls_key",
        help = "PEM certificate enabling TLS"
    )]
    pub tls_cert: Option<PathBuf>,

    #[arg(
        long,
        value_name = "PATH",
        env = "CAPTURE_RELAY_TLS_KEY",
        requires = "tls_cert",
        help = "PEM private key enabling TLS"
    )]
    pub tls_key: Option<PathBuf>,
}

impl Config {
    pub fn keepalive_period(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn jwks_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.jwks_cache_secs)
    }
}
