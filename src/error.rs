use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("certificate parse error: {0}")]
    CertParse(String),

    #[error("failed to bind listener on {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    #[error("listener accept failed: {0}")]
    Accept(io::Error),

    #[error("TLS handshake failed: {0}")]
    Handshake(io::Error),

    #[error("backend dial to {addr} failed: {reason}")]
    Dial { addr: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
