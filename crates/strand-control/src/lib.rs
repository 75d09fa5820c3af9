//! `strand-control`: the controller of a fault-tolerant pipelined sequence
//! alignment.
//!
//! The controller splits the alignment matrix into virtual partitions and
//! feeds them, one round at a time, to a linear pipeline of accelerator
//! workers. Between rounds it validates the column checkpoint the round left
//! behind, measures per-stage throughput and re-splits the next round.
//! When any stage fails it rolls the fleet back to the newest valid
//! checkpoint and continues.
//!
//! ```text
//!                    control sockets (EXEC| / END|)
//!   ┌────────────┐ ─────────────┬──────────────┬──────────────┐
//!   │ Controller │              ▼              ▼              ▼
//!   └────────────┘          ┌────────┐     ┌────────┐     ┌────────┐
//!        ▲   ▲   out<p>.bin │stage 0 │────▶│stage 1 │────▶│stage 2 │──▶ out<p'>.bin
//!        │   │              └────────┘     └────────┘     └────────┘
//!        │   └──────────── 4-byte progress acks ──────────────┘
//!        └─────────────── share/failure.txt
//! ```

pub mod checkpoint;
pub mod command;
pub mod controller;
pub mod decision;
pub mod detector;
pub mod error;
pub mod fleet;
pub mod journal;
pub mod policy;
pub mod process;
pub mod recovery;
pub mod split;
pub mod throughput;
pub mod validator;

// ── Public re-exports ────────────────────────────────────────────────────────

pub use checkpoint::{Checkpoint, CheckpointLedger, Resolution, ResumePoint};
pub use command::{ControlMessage, ExecCommand, RoundContext};
pub use controller::{Controller, RunOutcome};
pub use decision::{DecisionModule, Verdict};
pub use detector::{FailureDetector, RoundSignal};
pub use error::{ControlError, Result};
pub use fleet::{FleetState, Node};
pub use policy::ControlPolicies;
pub use process::{LaunchCommand, ProcessManager, ShellProcessManager};
pub use recovery::RecoveryManager;
pub use split::{normalization, Proposal, SplitVector};
