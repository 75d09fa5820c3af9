//! Upstream writer: owns the listening socket of one pipeline link.
//!
//! Lifecycle: [`CellListener::bind`] → [`CellListener::accept`] (exactly one
//! downstream peer) → any number of [`CellWriter::write`] calls →
//! [`CellWriter::write_score`] → [`CellWriter::close`].

use std::io;
use std::net::{Ipv4Addr, SocketAddr};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use strand_types::{Cell, GlobalScore};

use crate::error::{Result, StreamError};
use crate::policy::StreamPolicy;
use crate::sentinel::SharedDir;
use crate::{ACK_LEN, FINISHED_ACK};

// ── Listener ─────────────────────────────────────────────────────────────────

/// Bound, listening, not yet connected writer.
pub struct CellListener {
    listener: TcpListener,
    shared: SharedDir,
    policy: StreamPolicy,
}

impl CellListener {
    /// Bind `0.0.0.0:port`. Failure is a startup error.
    pub async fn bind(port: u16, shared: SharedDir) -> Result<Self> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let listener = TcpListener::bind(addr).await.map_err(|e| StreamError::Startup {
            phase: "bind",
            reason: format!("{addr}: {e}"),
        })?;
        debug!(%addr, "cell writer listening");
        Ok(Self {
            listener,
            shared,
            policy: StreamPolicy::default(),
        })
    }

    pub fn with_policy(mut self, policy: StreamPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Wait for the single downstream peer, then stop listening.
    pub async fn accept(self) -> Result<CellWriter> {
        let (stream, peer) = self.listener.accept().await.map_err(|e| StreamError::Startup {
            phase: "accept",
            reason: e.to_string(),
        })?;
        info!(%peer, "cell writer handling downstream peer");
        Ok(CellWriter {
            stream: Some(stream),
            shared: self.shared,
            policy: self.policy,
            peer,
            bytes_sent: 0,
        })
    }
}

// ── Writer ───────────────────────────────────────────────────────────────────

/// How the close handshake ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Downstream sent its "finished" acknowledgement.
    Acknowledged,
    /// Downstream vanished first; the failure sentinel was raised.
    PeerLost,
}

pub struct CellWriter {
    stream: Option<TcpStream>,
    shared: SharedDir,
    policy: StreamPolicy,
    peer: SocketAddr,
    bytes_sent: u64,
}

impl CellWriter {
    /// Bind, listen and accept in one call.
    pub async fn open(port: u16, shared: SharedDir) -> Result<Self> {
        CellListener::bind(port, shared).await?.accept().await
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Send `cells`, retrying a stalled or failing socket. Returns the number
    /// of bytes written.
    ///
    /// After the retry budget is spent the socket is closed, the failure
    /// sentinel is raised and [`StreamError::PeerLost`] is returned.
    pub async fn write(&mut self, cells: &[Cell]) -> Result<usize> {
        let mut buf = Vec::new();
        Cell::encode_all(cells, &mut buf);

        let stream = self.stream.as_mut().ok_or(StreamError::Closed)?;
        let mut sent = 0usize;
        let mut failures = 0u32;

        loop {
            match send_when_writable(stream, &buf, &mut sent, &self.policy).await {
                Ok(()) => {
                    self.bytes_sent += buf.len() as u64;
                    return Ok(buf.len());
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        peer = %self.peer,
                        attempt = failures,
                        max = self.policy.io.attempts,
                        error = %e,
                        "cell send failed"
                    );
                    if failures >= self.policy.io.attempts {
                        break;
                    }
                    self.policy.io.pause().await;
                }
            }
        }

        self.abandon().await;
        Err(StreamError::PeerLost(format!(
            "downstream {} stopped accepting cells",
            self.peer
        )))
    }

    /// Send the partition's global score after the last cell.
    pub async fn write_score(&mut self, score: GlobalScore) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(StreamError::Closed)?;
        stream.write_all(&score.to_bytes()).await.map_err(|e| {
            warn!(peer = %self.peer, error = %e, "score send failed");
            StreamError::Io(e)
        })
    }

    /// Two-phase close: wait for downstream's acknowledgement (or its loss),
    /// mark the graceful close in the shared directory, then drop the socket.
    pub async fn close(mut self) -> Result<CloseOutcome> {
        let outcome = match self.stream.take() {
            Some(mut stream) => {
                let outcome = self.wait_for_finish(&mut stream).await;
                if outcome == CloseOutcome::PeerLost {
                    self.shared.raise_failure().await;
                }
                let _ = stream.shutdown().await;
                outcome
            }
            None => CloseOutcome::PeerLost,
        };
        self.shared.mark_socket_closed().await?;
        info!(peer = %self.peer, ?outcome, bytes = self.bytes_sent, "cell writer closed");
        Ok(outcome)
    }

    async fn wait_for_finish(&self, stream: &mut TcpStream) -> CloseOutcome {
        info!(peer = %self.peer, "finished sending cells; waiting for downstream to finish");
        let mut ack = [0u8; ACK_LEN];
        let mut filled = 0usize;
        let mut quiet = 0u32;

        loop {
            let n = match stream.read(&mut ack[filled..]).await {
                Ok(n) => n,
                Err(e) => {
                    debug!(error = %e, "receive error while waiting for acknowledgement");
                    0
                }
            };
            if n == 0 {
                quiet += 1;
                if quiet >= self.policy.io.attempts {
                    warn!(peer = %self.peer, "connection lost before downstream finished");
                    return CloseOutcome::PeerLost;
                }
                debug!(attempt = quiet, "no acknowledgement yet");
                self.policy.io.pause().await;
                continue;
            }
            filled += n;
            if filled == ACK_LEN {
                if ack == FINISHED_ACK {
                    return CloseOutcome::Acknowledged;
                }
                debug!("ignoring unexpected message from downstream");
                filled = 0;
            }
        }
    }

    async fn abandon(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        self.shared.raise_failure().await;
    }
}

/// One send attempt: write `buf[*sent..]` with non-blocking sends, each
/// preceded by a writability probe bounded by `policy.probe`. A probe that
/// times out fails the attempt. `sent` survives failed attempts so a retry
/// never duplicates bytes.
async fn send_when_writable(
    stream: &mut TcpStream,
    buf: &[u8],
    sent: &mut usize,
    policy: &StreamPolicy,
) -> io::Result<()> {
    while *sent < buf.len() {
        match tokio::time::timeout(policy.probe, stream.writable()).await {
            Err(_) => return Err(io::Error::new(io::ErrorKind::WouldBlock, "socket not writable")),
            Ok(Err(e)) => return Err(e),
            Ok(Ok(())) => {}
        }
        match stream.try_write(&buf[*sent..]) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "peer stopped reading")),
            Ok(n) => *sent += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::policy::RetryPolicy;

    fn fast_policy() -> StreamPolicy {
        StreamPolicy {
            io: RetryPolicy::new(3, Duration::from_millis(10)),
            connect: RetryPolicy::new(100, Duration::from_millis(5)),
            probe: Duration::from_millis(50),
        }
    }

    async fn listener(shared: SharedDir) -> (CellListener, SocketAddr) {
        let l = CellListener::bind(0, shared).await.unwrap().with_policy(fast_policy());
        let port = l.local_addr().unwrap().port();
        (l, SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
    }

    #[tokio::test]
    async fn acknowledged_close_marks_socket_closed() {
        let dir = tempfile::tempdir().unwrap();
        let shared = SharedDir::new(dir.path());
        let (l, addr) = listener(shared.clone()).await;

        let peer = tokio::spawn(async move {
            let mut s = TcpStream::connect(addr).await.unwrap();
            let mut cells = [0u8; 16];
            s.read_exact(&mut cells).await.unwrap();
            s.write_all(&FINISHED_ACK).await.unwrap();
            cells
        });

        let mut writer = l.accept().await.unwrap();
        let n = writer.write(&[Cell::gap(1, 2), Cell::gap(3, 4)]).await.unwrap();
        assert_eq!(n, 16);
        assert_eq!(writer.bytes_sent(), 16);
        assert_eq!(writer.close().await.unwrap(), CloseOutcome::Acknowledged);

        let received = peer.await.unwrap();
        assert_eq!(&received[..8], &Cell::gap(1, 2).to_bytes());
        assert!(shared.close_socket_path().exists());
        assert!(!shared.failure_path().exists());
    }

    #[tokio::test]
    async fn vanished_peer_raises_failure_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let shared = SharedDir::new(dir.path());
        let (l, addr) = listener(shared.clone()).await;

        let peer = tokio::spawn(async move {
            let s = TcpStream::connect(addr).await.unwrap();
            drop(s);
        });

        let writer = l.accept().await.unwrap();
        peer.await.unwrap();
        assert_eq!(writer.close().await.unwrap(), CloseOutcome::PeerLost);
        assert!(shared.failure_path().exists());
        assert!(shared.close_socket_path().exists());
    }

    #[tokio::test]
    async fn stalled_peer_escalates_to_failure() {
        let dir = tempfile::tempdir().unwrap();
        let shared = SharedDir::new(dir.path());
        let (l, addr) = listener(shared.clone()).await;

        // Connects but never reads, so the socket buffers fill up.
        let peer = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let mut writer = l.accept().await.unwrap();
        let _held = peer.await.unwrap();

        let column: Vec<Cell> = (0..4_000_000).map(|i| Cell::gap(i, i)).collect();
        let err = writer.write(&column).await.unwrap_err();
        assert!(matches!(err, StreamError::PeerLost(_)));
        assert!(shared.failure_path().exists());
        assert_eq!(writer.bytes_sent(), 0);

        let err = writer.write(&[Cell::gap(0, 0)]).await.unwrap_err();
        assert!(matches!(err, StreamError::Closed));
    }

    #[tokio::test]
    async fn write_after_close_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let shared = SharedDir::new(dir.path());
        let (l, addr) = listener(shared.clone()).await;

        let _peer = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let mut writer = l.accept().await.unwrap();
        writer.abandon().await;

        let err = writer.write(&[Cell::gap(0, 0)]).await.unwrap_err();
        assert!(matches!(err, StreamError::Closed));
        assert!(shared.failure_path().exists());
    }

    #[tokio::test]
    async fn bind_conflict_is_startup_error() {
        let dir = tempfile::tempdir().unwrap();
        let shared = SharedDir::new(dir.path());
        let (l, _) = listener(shared.clone()).await;
        let port = l.local_addr().unwrap().port();

        let err = CellListener::bind(port, shared).await.err().unwrap();
        assert!(matches!(err, StreamError::Startup { phase: "bind", .. }));
    }
}
