use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::config::HostPort;
use crate::error::{Error, Result};
use crate::proxy::conn::Connection;

/// Opens one fresh TLS connection to the backend per call. No pooling.
pub struct BackendDialer {
    addr: HostPort,
    server_name: ServerName<'static>,
    connector: TlsConnector,
}

impl BackendDialer {
    /// The backend host is also the name its certificate is verified against.
    pub fn new(addr: HostPort, client_config: Arc<ClientConfig>) -> Result<Self> {
        let server_name = ServerName::try_from(addr.host().to_string()).map_err(|e| {
            Error::Config(format!("invalid backend host '{}': {e}", addr.host()))
        })?;

        Ok(Self {
            addr,
            server_name,
            connector: TlsConnector::from(client_config),
        })
    }

    pub fn addr(&self) -> &HostPort {
        &self.addr
    }

    pub async fn dial(&self) -> Result<Connection<TlsStream<TcpStream>>> {
        let tcp_stream = TcpStream::connect((self.addr.host(), self.addr.port()))
            .await
            .map_err(|e| self.dial_error(e))?;
        let peer_addr = tcp_stream.peer_addr().map_err(|e| self.dial_error(e))?;
        tcp_stream.set_nodelay(true).ok();

        let tls_stream = self
            .connector
            .connect(self.server_name.clone(), tcp_stream)
            .await
            .map_err(|e| self.dial_error(e))?;

        debug!(backend = %peer_addr, "backend connection established");
        Ok(Connection::new(tls_stream, peer_addr))
    }

    fn dial_error(&self, e: std::io::Error) -> Error {
        Error::Dial {
            addr: self.addr.to_string(),
            reason: e.to_string(),
        }
    }
}
