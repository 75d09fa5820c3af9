//! Live fleet: configured nodes, their control sockets and the partition
//! bookkeeping that depends on fleet size.
//!
//! ```text
//! vgpu = part + (breakpoints + 1 - round) × fleet
//! ```
//!
//! A node whose launcher cannot be reached is pruned. Pruning keeps the
//! invariant above and re-splits every round that has not been launched.

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{info, warn};

use strand_stream::RetryPolicy;
use strand_types::{ControllerConfig, HostSettings, NodeSpec};

use crate::command::ControlMessage;
use crate::error::{ControlError, Result};
use crate::split::SplitVector;

// ── Node ─────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Node {
    pub spec: NodeSpec,
    /// Configured round-0 weight.
    pub weight: u32,
    control: Option<TcpStream>,
}

impl Node {
    pub fn new(spec: NodeSpec, weight: u32) -> Self {
        Self { spec, weight, control: None }
    }

    pub fn is_connected(&self) -> bool {
        self.control.is_some()
    }

    /// Write one message to the node's launcher.
    pub async fn send(&mut self, msg: &ControlMessage) -> Result<()> {
        let stream = self.control.as_mut().ok_or_else(|| {
            ControlError::Protocol(format!("node {} is not connected", self.spec.address))
        })?;
        stream.write_all(msg.encode().as_bytes()).await?;
        Ok(())
    }

    pub async fn disconnect(&mut self) {
        if let Some(mut stream) = self.control.take() {
            let _ = stream.shutdown().await;
        }
    }
}

// ── Fleet state ──────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct FleetState {
    pub config: ControllerConfig,
    /// Live fleet in pipeline order.
    pub nodes: Vec<Node>,
    /// Workers taking part in dynamic mode (0 when static).
    pub dynamic_workers: u32,
    pub breakpoints: u32,
    /// Partitions launched so far.
    pub part: u32,
    /// Total number of virtual partitions.
    pub vgpu: u32,
    pub splits: SplitVector,
    /// Fleet size the split vector was last computed for.
    split_fleet: usize,
    dynamic_vetoed: bool,
}

impl FleetState {
    pub fn new(config: ControllerConfig) -> Self {
        let mut state = Self {
            nodes: Vec::new(),
            dynamic_workers: 0,
            breakpoints: 0,
            part: 0,
            vgpu: 0,
            splits: SplitVector::default(),
            split_fleet: 0,
            dynamic_vetoed: false,
            config,
        };
        state.adopt_config();
        state.vgpu = state.vgpu_for(0);
        state
    }

    pub fn fleet(&self) -> usize {
        self.nodes.len()
    }

    pub fn specs(&self) -> Vec<NodeSpec> {
        self.nodes.iter().map(|n| n.spec.clone()).collect()
    }

    /// `part + (breakpoints + 1 - round) × fleet`.
    pub fn vgpu_for(&self, round: u32) -> u32 {
        let remaining = (self.breakpoints + 1).saturating_sub(round);
        self.part + remaining * self.fleet() as u32
    }

    /// Run as a single static round from now on.
    pub fn disable_dynamic(&mut self) {
        self.dynamic_vetoed = true;
        self.breakpoints = 0;
        self.dynamic_workers = 0;
        self.vgpu = self.vgpu_for(0);
    }

    /// Build the split vector for the connected fleet.
    pub fn init_splits(&mut self) {
        let weights: Vec<u32> = self.nodes.iter().map(|n| n.weight).collect();
        self.splits = SplitVector::initial(self.breakpoints + 1, &weights);
        self.split_fleet = self.fleet();
    }

    /// Drop node `index` after its launcher proved unreachable during
    /// `round`.
    pub fn prune(&mut self, index: usize, round: u32) -> Result<()> {
        let node = self.nodes.remove(index);
        if self.dynamic_workers > 0 {
            self.dynamic_workers -= 1;
        }
        warn!(
            node = %node.spec.address,
            device = node.spec.device,
            remaining = self.fleet(),
            "pruned unreachable node"
        );
        if self.nodes.is_empty() {
            return Err(ControlError::FleetExhausted);
        }
        self.vgpu = self.vgpu_for(round);
        self.splits.refresh(self.part, self.vgpu, self.fleet());
        self.split_fleet = self.fleet();
        Ok(())
    }

    /// Recompute `vgpu` for `round` and fit the split vector to the fleet.
    pub fn settle(&mut self, round: u32) {
        self.vgpu = self.vgpu_for(round);
        if self.split_fleet != self.fleet() {
            self.splits.refresh(self.part, self.vgpu, self.fleet());
            self.split_fleet = self.fleet();
        } else if self.splits.len() < self.vgpu as usize {
            let start = self.splits.len();
            self.splits.refresh(start as u32, self.vgpu, self.fleet());
        }
    }

    /// Replace the configuration with a freshly loaded one. Every control
    /// socket must already be closed.
    pub fn reload(&mut self, config: ControllerConfig) {
        self.config = config;
        self.adopt_config();
    }

    pub async fn disconnect_all(&mut self) {
        for node in &mut self.nodes {
            node.disconnect().await;
        }
    }

    fn adopt_config(&mut self) {
        self.nodes = self
            .config
            .nodes
            .iter()
            .zip(self.config.split.iter().copied().chain(std::iter::repeat(1)))
            .map(|(spec, weight)| Node::new(spec.clone(), weight))
            .collect();
        if self.dynamic_vetoed {
            self.breakpoints = 0;
            self.dynamic_workers = 0;
        } else {
            self.breakpoints = self.config.breakpoints;
            self.dynamic_workers = self.config.dynamic_workers();
        }
    }
}

// ── Connection manager ───────────────────────────────────────────────────────

/// Connect to every node's launcher at `base_port + device`, pruning the
/// ones that stay unreachable. Fails only when no node is left.
pub async fn connect_fleet(
    state: &mut FleetState,
    host: &HostSettings,
    round: u32,
    policy: RetryPolicy,
) -> Result<()> {
    info!(nodes = state.fleet(), round, "connecting to worker launchers");
    let mut index = 0;
    while index < state.nodes.len() {
        let spec = state.nodes[index].spec.clone();
        match connect_control(&spec, host.base_port, policy).await {
            Some(stream) => {
                info!(node = %spec.address, device = spec.device, "launcher connected");
                state.nodes[index].control = Some(stream);
                index += 1;
            }
            None => state.prune(index, round)?,
        }
    }
    info!(fleet = state.fleet(), vgpu = state.vgpu, "fleet connected");
    Ok(())
}

async fn connect_control(spec: &NodeSpec, base_port: u16, policy: RetryPolicy) -> Option<TcpStream> {
    let port = spec.control_port(base_port);
    for attempt in 1..=policy.attempts {
        match TcpStream::connect((spec.address.as_str(), port)).await {
            Ok(stream) => return Some(stream),
            Err(e) => {
                warn!(
                    node = %spec.address,
                    port,
                    attempt,
                    max = policy.attempts,
                    error = %e,
                    "launcher connect failed"
                );
                if attempt < policy.attempts {
                    policy.pause().await;
                }
            }
        }
    }
    None
}

// ── Tests ─────────────────────────────────────────────────────────────────────
