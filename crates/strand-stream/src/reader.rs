//! Downstream reader: connects to the previous stage's writer and pulls its
//! boundary column and global score.

use std::net::SocketAddr;
use std::path::PathBuf;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use strand_types::{Cell, CellKind, GlobalScore, CELL_SIZE, SCORE_SIZE};

use crate::error::{Result, StreamError};
use crate::policy::StreamPolicy;
use crate::sentinel::SharedDir;
use crate::FINISHED_ACK;

/// Log a connect failure only every this many attempts.
const CONNECT_LOG_EVERY: u32 = 100;

pub struct CellReader {
    stream: Option<TcpStream>,
    shared: SharedDir,
    /// Kernel end-of-execution marker of the upstream partition.
    end_signal: PathBuf,
    kind: CellKind,
    policy: StreamPolicy,
    peer: SocketAddr,
}

impl CellReader {
    /// Connect with production retry policies.
    pub async fn open(host: &str, port: u16, shared: SharedDir, end_signal: PathBuf) -> Result<Self> {
        Self::open_with_policy(host, port, shared, end_signal, StreamPolicy::default()).await
    }

    /// Resolve `host`, clear stale sentinels, then connect, tolerating an
    /// upstream that has not bound its socket yet.
    ///
    /// Exhausting the connect budget raises the failure sentinel and returns
    /// a startup error.
    pub async fn open_with_policy(
        host: &str,
        port: u16,
        shared: SharedDir,
        end_signal: PathBuf,
        policy: StreamPolicy,
    ) -> Result<Self> {
        shared.clear_stale().await;

        let addr = tokio::net::lookup_host((host, port))
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| StreamError::Startup {
                phase: "resolve",
                reason: format!("cannot resolve hostname {host}"),
            })?;

        info!(%addr, "connecting to upstream writer");
        let mut attempt = 0u32;
        let stream = loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => break stream,
                Err(e) => {
                    if attempt % CONNECT_LOG_EVERY == 0 {
                        warn!(%addr, attempt, max = policy.connect.attempts, error = %e, "upstream not reachable yet");
                    }
                    attempt += 1;
                    if attempt >= policy.connect.attempts {
                        shared.raise_failure().await;
                        return Err(StreamError::Startup {
                            phase: "connect",
                            reason: format!("{addr} unreachable after {attempt} attempts"),
                        });
                    }
                    policy.connect.pause().await;
                }
            }
        };
        info!(%addr, "connected to upstream writer");

        Ok(Self {
            stream: Some(stream),
            shared,
            end_signal,
            kind: CellKind::Gap,
            policy,
            peer: addr,
        })
    }

    /// Interpretation applied to the second word of received cells.
    pub fn with_kind(mut self, kind: CellKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Fill `out` with cells from upstream; returns how many were read.
    ///
    /// A quiet socket is retried. Once the retry budget is spent, a
    /// graceful-end marker from upstream turns the short read into a normal
    /// end of stream; without one the socket is closed, the failure sentinel
    /// is raised and [`StreamError::PeerLost`] is returned. Hard receive
    /// errors close the socket immediately.
    pub async fn read(&mut self, out: &mut [Cell]) -> Result<usize> {
        let want = out.len() * CELL_SIZE;
        let mut buf = vec![0u8; want];
        let mut pos = 0usize;
        let mut quiet = 0u32;

        while pos < want {
            let stream = self.stream.as_mut().ok_or(StreamError::Closed)?;
            match stream.read(&mut buf[pos..]).await {
                Ok(0) => {
                    quiet += 1;
                    if quiet < self.policy.io.attempts {
                        debug!(attempt = quiet, "upstream quiet");
                        self.policy.io.pause().await;
                        continue;
                    }
                    if self.shared.peer_finished(&self.end_signal).await {
                        info!(peer = %self.peer, cells = pos / CELL_SIZE, "upstream finished; end of stream");
                        break;
                    }
                    warn!(peer = %self.peer, "connection lost");
                    self.drop_stream().await;
                    self.shared.raise_failure().await;
                    return Err(StreamError::PeerLost(format!(
                        "upstream {} went silent without finishing",
                        self.peer
                    )));
                }
                Ok(n) => {
                    pos += n;
                    quiet = 0;
                }
                Err(e) => {
                    warn!(peer = %self.peer, error = %e, "receive error");
                    self.drop_stream().await;
                    return Err(StreamError::Io(e));
                }
            }
        }

        let cells = pos / CELL_SIZE;
        if pos % CELL_SIZE != 0 {
            warn!(
                peer = %self.peer,
                dropped = pos % CELL_SIZE,
                "stream ended inside a cell; trailing bytes dropped"
            );
        }
        let decoded = Cell::decode_all(&buf[..cells * CELL_SIZE], self.kind)
            .map_err(|e| StreamError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())))?;
        out[..cells].copy_from_slice(&decoded);
        Ok(cells)
    }

    /// Receive the global score that follows the cell stream.
    pub async fn read_score(&mut self) -> Result<GlobalScore> {
        let stream = self.stream.as_mut().ok_or(StreamError::Closed)?;
        let mut raw = [0u8; SCORE_SIZE];
        match stream.read_exact(&mut raw).await {
            Ok(_) => Ok(GlobalScore::from_bytes(raw)),
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "score receive failed");
                self.send_finished().await;
                self.drop_stream().await;
                Err(StreamError::Io(e))
            }
        }
    }

    /// Tell upstream this stage is done, then close.
    pub async fn close(mut self) {
        self.send_finished().await;
        self.drop_stream().await;
        debug!(peer = %self.peer, "cell reader closed");
    }

    async fn send_finished(&mut self) {
        if let Some(stream) = self.stream.as_mut() {
            info!(peer = %self.peer, "sending finished message upstream");
            if let Err(e) = stream.write_all(&FINISHED_ACK).await {
                debug!(error = %e, "finished message not delivered");
            }
        }
    }

    async fn drop_stream(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
