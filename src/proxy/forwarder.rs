use std::any::Any;
use std::fmt;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinError;
use tracing::{debug, error, info, trace, warn};

use crate::proxy::conn::{CloseHandle, Connection, CLOSE_NOTIFY_TIMEOUT};

/// Size of the buffer each copy direction reads into.
pub const BUFFER_SIZE: usize = 32 * 1024;

/// Which way a copy loop moves bytes, labelled by where the bytes come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to backend.
    Server,
    /// Backend to client.
    Client,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Server => f.write_str("Server"),
            Direction::Client => f.write_str("Client"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("read failed: {0}")]
    Read(io::Error),

    #[error("write failed: {0}")]
    Write(io::Error),

    #[error("short write: {written} of {expected} bytes accepted")]
    ShortWrite { written: usize, expected: usize },
}

/// How a copy direction ended.
#[derive(Debug)]
pub enum Termination {
    /// The source reached end of stream.
    Eof,
    /// One of the two connections was closed by the sibling direction.
    TornDown,
    Failed(RelayError),
    /// The copy task panicked; holds the panic message.
    Panicked(String),
    /// The copy task was cancelled by the runtime.
    Cancelled,
}

impl Termination {
    pub fn is_clean(&self) -> bool {
        matches!(self, Termination::Eof | Termination::TornDown)
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Eof => f.write_str("end of stream"),
            Termination::TornDown => f.write_str("torn down"),
            Termination::Failed(e) => write!(f, "{e}"),
            Termination::Panicked(msg) => write!(f, "panicked: {msg}"),
            Termination::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug)]
pub struct DirectionReport {
    pub direction: Direction,
    /// Bytes fully written to the destination.
    pub bytes: u64,
    pub termination: Termination,
}

#[derive(Debug)]
pub struct TunnelReport {
    pub server: DirectionReport,
    pub client: DirectionReport,
}

/// A client connection paired with its backend connection.
///
/// Running the tunnel spawns one task per direction. Each task, when its loop
/// ends for any reason, closes both connections, which unblocks the other task.
pub struct Tunnel<C, B> {
    client: Connection<C>,
    backend: Connection<B>,
}

impl<C, B> Tunnel<C, B>
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(client: Connection<C>, backend: Connection<B>) -> Self {
        Self { client, backend }
    }

    /// Relay until both directions have finished.
    pub async fn run(self) -> TunnelReport {
        let (client_stream, client_close) = self.client.into_parts();
        let (backend_stream, backend_close) = self.backend.into_parts();

        let (client_rd, client_wr) = tokio::io::split(client_stream);
        let (backend_rd, backend_wr) = tokio::io::split(backend_stream);

        let server = tokio::spawn(copy_direction(
            Direction::Server,
            client_rd,
            backend_wr,
            client_close.clone(),
            backend_close.clone(),
        ));
        let client = tokio::spawn(copy_direction(
            Direction::Client,
            backend_rd,
            client_wr,
            backend_close,
            client_close,
        ));

        let (server, client) = tokio::join!(server, client);

        TunnelReport {
            server: supervise(Direction::Server, server),
            client: supervise(Direction::Client, client),
        }
    }
}

/// Turn a copy task's join result into a report, containing panics.
fn supervise(
    direction: Direction,
    joined: Result<DirectionReport, JoinError>,
) -> DirectionReport {
    let termination = match joined {
        Ok(report) => return report,
        Err(e) if e.is_panic() => {
            let msg = panic_message(e.into_panic());
            error!(direction = %direction, panic = %msg, "recovered while tunneling");
            Termination::Panicked(msg)
        }
        Err(_) => Termination::Cancelled,
    };

    DirectionReport {
        direction,
        bytes: 0,
        termination,
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Raises both close flags when dropped, including during a panic unwind.
struct CloseBoth([CloseHandle; 2]);

impl Drop for CloseBoth {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.close();
        }
    }
}

async fn copy_direction<R, W>(
    direction: Direction,
    mut src: R,
    mut dst: W,
    src_close: CloseHandle,
    dst_close: CloseHandle,
) -> DirectionReport
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let guard = CloseBoth([src_close.clone(), dst_close.clone()]);
    let mut bytes = 0u64;

    let result = pump(direction, &mut src, &mut dst, &src_close, &dst_close, &mut bytes).await;

    drop(guard);
    if tokio::time::timeout(CLOSE_NOTIFY_TIMEOUT, dst.shutdown())
        .await
        .is_err()
    {
        debug!(direction = %direction, "close_notify timed out");
    }

    let termination = match result {
        Ok(end) => end,
        Err(e) => Termination::Failed(e),
    };

    match &termination {
        Termination::Failed(e) => {
            warn!(direction = %direction, bytes, error = %e, "tunneling is done")
        }
        other => info!(direction = %direction, bytes, reason = %other, "tunneling is done"),
    }

    DirectionReport {
        direction,
        bytes,
        termination,
    }
}

/// Read-then-write until end of stream, an error, or teardown.
async fn pump<R, W>(
    direction: Direction,
    src: &mut R,
    dst: &mut W,
    src_close: &CloseHandle,
    dst_close: &CloseHandle,
    bytes: &mut u64,
) -> Result<Termination, RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];

    loop {
        let n = tokio::select! {
            biased;
            _ = torn_down(src_close, dst_close) => return Ok(Termination::TornDown),
            read = src.read(&mut buf) => match read {
                Ok(0) => return Ok(Termination::Eof),
                Ok(n) => n,
                // A peer that drops TCP without close_notify.
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(Termination::Eof),
                Err(e) => return Err(RelayError::Read(e)),
            },
        };

        // Full payload dump. Kept at TRACE: it exposes decrypted client data.
        trace!("{}: {}", direction, String::from_utf8_lossy(&buf[..n]));

        tokio::select! {
            biased;
            _ = torn_down(src_close, dst_close) => return Ok(Termination::TornDown),
            written = write_chunk(dst, &buf[..n]) => written?,
        }
        *bytes += n as u64;
    }
}

async fn torn_down(a: &CloseHandle, b: &CloseHandle) {
    tokio::select! {
        _ = a.closed() => {}
        _ = b.closed() => {}
    }
}

/// Write the whole chunk. A write that accepts nothing before the chunk is
/// done counts as a short write.
async fn write_chunk<W: AsyncWrite + Unpin>(dst: &mut W, chunk: &[u8]) -> Result<(), RelayError> {
    let mut written = 0;
    while written < chunk.len() {
        match dst.write(&chunk[written..]).await {
            Ok(0) => {
                return Err(RelayError::ShortWrite {
                    written,
                    expected: chunk.len(),
                })
            }
            Ok(n) => written += n,
            Err(e) => return Err(RelayError::Write(e)),
        }
    }
    dst.flush().await.map_err(RelayError::Write)
}
