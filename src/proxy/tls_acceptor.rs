use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use rustls::ServerConfig;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, warn};

use crate::config::{HostPort, ANY_HOST};
use crate::error::{Error, Result};
use crate::proxy::conn::Connection;
use crate::proxy::dialer::BackendDialer;
use crate::proxy::forwarder::Tunnel;

/// Bind the listening socket. Failure here is fatal for the process.
///
/// The wildcard host accepts both IPv4 and IPv6 clients, falling back to
/// IPv4 only on hosts without IPv6.
pub async fn bind(addr: &HostPort) -> Result<TcpListener> {
    let bound = if addr.host() == ANY_HOST {
        match bind_dual_stack(addr.port()) {
            Ok(listener) => Ok(listener),
            Err(e) => {
                warn!(error = %e, "dual-stack bind failed, listening on IPv4 only");
                TcpListener::bind((Ipv4Addr::UNSPECIFIED, addr.port())).await
            }
        }
    } else {
        TcpListener::bind((addr.host(), addr.port())).await
    };

    bound.map_err(|source| Error::Bind {
        addr: addr.to_string(),
        source,
    })
}

fn bind_dual_stack(port: u16) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_only_v6(false)?;
    #[cfg(unix)]
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)).into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}

/// Accepts TLS clients and relays each one to a freshly dialed backend.
pub struct Relay {
    acceptor: TlsAcceptor,
    dialer: Arc<BackendDialer>,
}

impl Relay {
    pub fn new(server_config: Arc<ServerConfig>, dialer: BackendDialer) -> Self {
        Self {
            acceptor: TlsAcceptor::from(server_config),
            dialer: Arc::new(dialer),
        }
    }

    pub fn backend_addr(&self) -> &HostPort {
        self.dialer.addr()
    }

    /// Run the accept loop until accepting fails.
    ///
    /// Every accepted socket is handled on its own task, so a slow handshake
    /// or a stalled tunnel never holds up the next accept.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (tcp_stream, peer_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!(error = %e, "error in listener accept");
                    return Err(Error::Accept(e));
                }
            };

            debug!(peer = %peer_addr, "accepted TCP connection");

            let acceptor = self.acceptor.clone();
            let dialer = self.dialer.clone();
            tokio::spawn(async move {
                handle(acceptor, dialer, tcp_stream, peer_addr).await;
            });
        }
    }
}

/// Handshake, dial, then tunnel. Every failure is logged and ends only this
/// connection.
async fn handle(
    acceptor: TlsAcceptor,
    dialer: Arc<BackendDialer>,
    tcp_stream: TcpStream,
    peer_addr: SocketAddr,
) {
    // Nothing is relayed until the handshake has completed.
    let tls_stream = match acceptor.accept(tcp_stream).await {
        Ok(stream) => stream,
        Err(e) => {
            // The TCP stream was consumed by the acceptor and is dropped here.
            warn!(peer = %peer_addr, error = %Error::Handshake(e), "error in TLS handshake");
            return;
        }
    };
    let client = Connection::new(tls_stream, peer_addr);

    let backend = match dialer.dial().await {
        Ok(conn) => conn,
        Err(e) => {
            warn!(peer = %peer_addr, error = %e, "error in backend dial");
            client.close().await;
            return;
        }
    };

    let backend_addr = backend.peer_addr();
    let report = Tunnel::new(client, backend).run().await;
    for side in [&report.server, &report.client] {
        if side.termination.is_clean() {
            debug!(
                peer = %peer_addr,
                backend = %backend_addr,
                direction = %side.direction,
                bytes = side.bytes,
                reason = %side.termination,
                "connection closed"
            );
        } else {
            warn!(
                peer = %peer_addr,
                backend = %backend_addr,
                direction = %side.direction,
                bytes = side.bytes,
                reason = %side.termination,
                "connection closed after relay failure"
            );
        }
    }
}
