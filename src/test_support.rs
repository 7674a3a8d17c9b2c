//! Certificates, a TLS backend and a TLS client for tests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::client::TlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::cert::loader::{build_client_config, build_server_config, root_store};

#[derive(Debug, Clone)]
pub struct TestCert {
    pub cert_pem: String,
    pub key_pem: String,
}

pub fn self_signed(host: &str) -> TestCert {
    let rcgen::CertifiedKey { cert, signing_key } =
        rcgen::generate_simple_self_signed(vec![host.to_string()]).expect("generate certificate");
    TestCert {
        cert_pem: cert.pem(),
        key_pem: signing_key.serialize_pem(),
    }
}

/// Default roots plus the given self-signed certificates.
pub fn trusting(certs: &[&TestCert]) -> ClientConfig {
    let mut roots = root_store(None).expect("default roots");
    for cert in certs {
        let der = rustls_pemfile::certs(&mut cert.cert_pem.as_bytes())
            .next()
            .expect("one certificate")
            .expect("valid PEM");
        roots.add(der).expect("usable trust anchor");
    }
    build_client_config(roots)
}

/// A TLS backend on loopback that answers `PING` with `PONG` and echoes
/// anything else until the peer closes.
pub async fn spawn_backend(cert: &TestCert) -> SocketAddr {
    let config = build_server_config(&cert.cert_pem, &cert.key_pem).expect("backend config");
    let acceptor = TlsAcceptor::from(Arc::new(config));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind backend");
    let addr = listener.local_addr().expect("backend addr");

    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(mut tls) = acceptor.accept(tcp).await else {
                    return;
                };
                let mut buf = [0u8; 1024];
                loop {
                    let n = match tls.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    let reply: &[u8] = if &buf[..n] == b"PING" { b"PONG" } else { &buf[..n] };
                    if tls.write_all(reply).await.is_err() || tls.flush().await.is_err() {
                        break;
                    }
                }
                let _ = tls.shutdown().await;
            });
        }
    });

    addr
}

pub struct RecordingBackend {
    pub addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
}

impl RecordingBackend {
    /// TCP connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

/// A TLS backend that never writes. Each connection reads until the peer
/// closes and then reports how many bytes it received.
pub async fn spawn_recording_backend(
    cert: &TestCert,
) -> (RecordingBackend, mpsc::UnboundedReceiver<Result<usize, String>>) {
    let config = build_server_config(&cert.cert_pem, &cert.key_pem).expect("backend config");
    let acceptor = TlsAcceptor::from(Arc::new(config));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind backend");
    let addr = listener.local_addr().expect("backend addr");
    let accepted = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::unbounded_channel();

    let counter = accepted.clone();
    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let acceptor = acceptor.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let outcome = match acceptor.accept(tcp).await {
                    Ok(mut tls) => {
                        let mut received = Vec::new();
                        tls.read_to_end(&mut received)
                            .await
                            .map(|_| received.len())
                            .map_err(|e| e.to_string())
                    }
                    Err(e) => Err(format!("handshake: {e}")),
                };
                let _ = tx.send(outcome);
            });
        }
    });

    (RecordingBackend { addr, accepted }, rx)
}

/// Connect and complete a TLS handshake with a relay serving `cert`.
pub async fn connect_client(addr: SocketAddr, cert: &TestCert) -> TlsStream<TcpStream> {
    let connector = TlsConnector::from(Arc::new(trusting(&[cert])));
    let tcp = TcpStream::connect(addr).await.expect("connect to relay");
    connector
        .connect(ServerName::try_from("localhost").expect("server name"), tcp)
        .await
        .expect("TLS handshake with relay")
}
