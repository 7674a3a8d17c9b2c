use std::fmt;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::error::{Error, Result};

/// Host used when the listen address omits one (`:44300`). Bound dual-stack.
pub const ANY_HOST: &str = "::";
/// Host used when the backend address omits one (`:8000`).
const LOCAL_HOST: &str = "localhost";

#[derive(Debug, Parser)]
#[command(
    name = "ssl-terminator",
    version,
    about = "Terminate TLS and relay the stream to a TLS backend"
)]
pub struct Cli {
    /// Local address to accept TLS connections on
    #[arg(short = 'l', long = "listen", env = "LISTEN_ADDR", default_value = ":44300")]
    pub listen: String,

    /// Backend address every client connection is relayed to
    #[arg(short = 'b', long = "backend", env = "BACKEND_ADDR", default_value = ":8000")]
    pub backend: String,

    /// SSL certificate path (PEM, leaf first)
    #[arg(short = 'c', long = "cert", env = "TLS_CERT", default_value = "cert.pem")]
    pub cert: PathBuf,

    /// SSL key path (PEM)
    #[arg(short = 'k', long = "key", env = "TLS_KEY", default_value = "key.pem")]
    pub key: PathBuf,

    /// Extra PEM trust anchors for verifying the backend certificate
    #[arg(long = "backend-ca", env = "BACKEND_CA")]
    pub backend_ca: Option<PathBuf>,

    /// Log output format
    #[arg(long = "log-format", env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: HostPort,
    pub backend_addr: HostPort,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub backend_ca: Option<PathBuf>,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl Config {
    pub fn from_args() -> Result<Self> {
        Self::from_cli(Cli::parse())
    }

    pub fn from_cli(cli: Cli) -> Result<Self> {
        let listen_addr = HostPort::parse(&cli.listen, ANY_HOST)
            .map_err(|e| Error::Config(format!("invalid listen address: {e}")))?;
        let backend_addr = HostPort::parse(&cli.backend, LOCAL_HOST)
            .map_err(|e| Error::Config(format!("invalid backend address: {e}")))?;

        Ok(Config {
            listen_addr,
            backend_addr,
            cert_path: cli.cert,
            key_path: cli.key,
            backend_ca: cli.backend_ca,
            log_format: cli.log_format,
        })
    }
}

/// A `host:port` pair that may still need name resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    host: String,
    port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port`, `[v6]:port` or `:port`. An empty host is replaced by
    /// `default_host`.
    pub fn parse(input: &str, default_host: &str) -> std::result::Result<Self, String> {
        let input = input.trim();
        let (host, port) = input
            .rsplit_once(':')
            .ok_or_else(|| format!("'{input}' is missing a ':port' suffix"))?;

        let host = match host.strip_prefix('[') {
            Some(rest) => rest
                .strip_suffix(']')
                .ok_or_else(|| format!("'{input}' has an unterminated '[' in the host"))?,
            None if host.contains(':') => {
                return Err(format!("'{input}': IPv6 hosts must be written as [addr]:port"))
            }
            None => host,
        };

        let port: u16 = port
            .parse()
            .map_err(|e| format!("'{input}' has an invalid port: {e}"))?;

        let host = if host.is_empty() { default_host } else { host };
        Ok(Self::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
