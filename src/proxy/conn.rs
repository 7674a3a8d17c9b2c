use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::debug;

/// Upper bound on sending a TLS `close_notify` to a peer that may have stopped
/// reading.
pub const CLOSE_NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared close flag for one connection.
///
/// Both copy directions of a tunnel hold a handle to each connection, so either
/// of them can tear the connection down and wake whatever the other one is
/// blocked on. Only the first `close` has an effect.
#[derive(Debug, Clone)]
pub struct CloseHandle {
    peer: SocketAddr,
    tx: Arc<watch::Sender<bool>>,
}

impl CloseHandle {
    pub fn new(peer: SocketAddr) -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            peer,
            tx: Arc::new(tx),
        }
    }

    /// Mark the connection closed. Returns `false` if it already was.
    pub fn close(&self) -> bool {
        let first = self.tx.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        });

        if first {
            debug!(peer = %self.peer, "connection closed");
        }
        first
    }

    /// Resolves once the connection is closed, immediately if it already is.
    pub async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        // The sender is owned by `self`, so this only returns once the flag is set.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// An established byte stream together with its peer identity and close flag.
pub struct Connection<S> {
    stream: S,
    peer: SocketAddr,
    closer: CloseHandle,
}

impl<S> Connection<S> {
    pub fn new(stream: S, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            closer: CloseHandle::new(peer),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    #[cfg(test)]
    pub fn close_handle(&self) -> CloseHandle {
        self.closer.clone()
    }

    pub fn into_parts(self) -> (S, CloseHandle) {
        (self.stream, self.closer)
    }
}

impl<S: AsyncWrite + Unpin> Connection<S> {
    /// Flag the connection closed and send a bounded `close_notify`. The
    /// socket itself is released when `self` drops.
    pub async fn close(mut self) {
        self.closer.close();
        if tokio::time::timeout(CLOSE_NOTIFY_TIMEOUT, self.stream.shutdown())
            .await
            .is_err()
        {
            debug!(peer = %self.peer, "close_notify timed out");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn peer() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[test]
    fn second_close_is_a_no_op() {
        let handle = CloseHandle::new(peer());
        let other = handle.clone();

        assert!(handle.close());
        assert!(!other.close());
        assert!(!handle.close());
    }

    #[tokio::test]
    async fn closed_wakes_waiters_and_resolves_after_the_fact() {
        let handle = CloseHandle::new(peer());
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.closed().await })
        };

        tokio::task::yield_now().await;
        handle.close();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke up")
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle.closed())
            .await
            .expect("already closed resolves immediately");
    }

    #[tokio::test]
    async fn close_shuts_down_the_write_side() {
        let (near, mut far) = tokio::io::duplex(64);
        let conn = Connection::new(near, peer());
        let handle = conn.close_handle();

        conn.close().await;

        assert!(!handle.close(), "already closed by Connection::close");
        let mut buf = [0u8; 8];
        assert_eq!(far.read(&mut buf).await.unwrap(), 0);
    }
}
