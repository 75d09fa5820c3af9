pub mod cell;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod layout;
pub mod node;

pub use cell::{Cell, CellAux, CellKind, GlobalScore, CELL_SIZE, SCORE_SIZE};
pub use config::{BalanceModel, ControllerConfig, HostSettings};
pub use endpoint::Endpoint;
pub use error::{Result, StrandError};
pub use layout::WorkDir;
pub use node::NodeSpec;
