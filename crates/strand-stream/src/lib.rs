//! `strand-stream`: the cell stream between adjacent pipeline stages.
//!
//! Every interior link of the pipeline is one TCP connection carrying the
//! upstream stage's rightmost boundary column, followed by its global score.
//! There is no framing: the reader is told how many cells to expect.
//!
//! ```text
//!   stage i                                   stage i+1
//! ┌──────────────┐   cells … cells, score   ┌──────────────┐
//! │  CellWriter  │ ───────────────────────▶ │  CellReader  │
//! │ (listens)    │ ◀─────── "finished" ──── │ (connects)   │
//! └──────────────┘                          └──────────────┘
//!        │ closesocket.txt / failure.txt           │
//!        └──────────── shared directory ───────────┘
//! ```
//!
//! Not every failure is visible as a socket event, so both roles also use
//! sentinel files in the shared directory: the writer marks a graceful close,
//! and either side raises the failure sentinel the controller watches.

pub mod error;
pub mod policy;
pub mod reader;
pub mod sentinel;
pub mod writer;

// ── Public re-exports ────────────────────────────────────────────────────────

pub use error::{Result, StreamError};
pub use policy::{RetryPolicy, StreamPolicy};
pub use reader::CellReader;
pub use sentinel::SharedDir;
pub use writer::{CellListener, CellWriter, CloseOutcome};

/// Length of the downstream "finished" acknowledgement.
pub const ACK_LEN: usize = 10;

/// The downstream reader's end-of-stream acknowledgement, NUL padded.
pub const FINISHED_ACK: [u8; ACK_LEN] = *b"finished\0\0";
