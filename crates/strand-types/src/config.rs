// Controller configuration: the line-oriented run file plus the host
// settings that come from the command line.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StrandError};
use crate::node::NodeSpec;

/// Lines shorter than this are ignored, matching the run-file convention.
const MIN_LINE_LEN: usize = 4;

// ── Balance model ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BalanceModel {
    /// One round, fixed split, no rebalancing.
    Static,
    /// Rebalance from throughput at every breakpoint.
    Dynamic,
    /// Dynamic, but an external decision program may veto rebalancing.
    Decision,
}

impl FromStr for BalanceModel {
    type Err = StrandError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "static" => Ok(Self::Static),
            "dynamic" => Ok(Self::Dynamic),
            "decision" => Ok(Self::Decision),
            other => Err(StrandError::Config(format!("unknown MODEL '{other}'"))),
        }
    }
}

impl fmt::Display for BalanceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static   => write!(f, "static"),
            Self::Dynamic  => write!(f, "dynamic"),
            Self::Decision => write!(f, "decision"),
        }
    }
}

// ── Run file ──────────────────────────────────────────────────────────────────

/// Everything read from the run file.
///
/// ```text
/// # two machines, one GPU each
/// GPUS 2
/// BREAK 2
/// GPU# 0,0
/// IP 192.168.0.10,192.168.0.11
/// PORT 6000,6001
/// SPLIT 1
/// SEQ seqs/a.fasta,seqs/b.fasta
/// MODEL dynamic
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Configured fleet, in pipeline order.
    pub nodes: Vec<NodeSpec>,
    pub block_pruning: bool,
    /// Number of rebalancing breakpoints; the run has `breakpoints + 1` rounds.
    pub breakpoints: u32,
    /// Ask each partition to wait for the same-slot partition of the previous round.
    pub wait_previous: bool,
    /// Per-node initial weights, one per configured node.
    pub split: Vec<u32>,
    /// Vertical (checkpointed) sequence.
    pub seq0: PathBuf,
    /// Horizontal sequence.
    pub seq1: PathBuf,
    pub model: BalanceModel,
    /// Decision-module program, required by `MODEL decision`.
    pub prog: Option<String>,
    /// Advertised per-node GFLOPS, passed to the decision module.
    pub gflops: Vec<u64>,
}

impl ControllerConfig {
    /// Read and validate a run file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            StrandError::Config(format!("failed to open config file {}: {e}", path.display()))
        })?;
        Self::parse(&text)
    }

    /// Parse and validate run-file text.
    pub fn parse(text: &str) -> Result<Self> {
        let mut gpus: Option<usize> = None;
        let mut block_pruning = true;
        let mut breakpoints = 0u32;
        let mut wait_previous = false;
        let mut devices: Vec<u32> = Vec::new();
        let mut ips: Vec<String> = Vec::new();
        let mut ports: Vec<u16> = Vec::new();
        let mut split: Option<Vec<u32>> = None;
        let mut seqs: Vec<String> = Vec::new();
        let mut model = BalanceModel::Dynamic;
        let mut prog = None;
        let mut gflops: Vec<u64> = Vec::new();

        for line in text.lines() {
            if line.starts_with('#') || line.len() < MIN_LINE_LEN {
                continue;
            }
            let Some((key, value)) = line.trim_end().split_once(' ') else {
                continue;
            };
            let value = value.trim();
            match key {
                "GPUS" => gpus = Some(parse_scalar(key, value)?),
                "BP" => block_pruning = parse_scalar::<i64>(key, value)? != 0,
                "BREAK" => breakpoints = parse_scalar(key, value)?,
                "WAIT" => wait_previous = parse_scalar::<i64>(key, value)? != 0,
                "GPU#" => devices = parse_list(key, value)?,
                "IP" => ips = parse_list(key, value)?,
                "PORT" => ports = parse_list(key, value)?,
                "SPLIT" => split = Some(parse_list(key, value)?),
                "SEQ" => seqs = parse_list(key, value)?,
                "MODEL" => model = value.parse()?,
                "PROG" => prog = Some(value.to_string()),
                "GFLOPS" => gflops = parse_list(key, value)?,
                _ => {}
            }
        }

        let gpus = gpus.ok_or_else(|| StrandError::Config("missing GPUS".into()))?;
        if gpus == 0 {
            return Err(StrandError::Config("GPUS must be at least 1".into()));
        }
        require_len("GPU#", devices.len(), gpus)?;
        if let Some(device) = devices[..gpus].iter().find(|&&d| d > u32::from(u16::MAX)) {
            return Err(StrandError::Config(format!(
                "GPU#: device {device} does not fit a port offset"
            )));
        }
        require_len("IP", ips.len(), gpus)?;
        require_len("PORT", ports.len(), gpus)?;

        // A single SPLIT value means "equal weights".
        let split = match split {
            None => vec![1; gpus],
            Some(values) if values.len() == 1 => vec![1; gpus],
            Some(values) => {
                require_len("SPLIT", values.len(), gpus)?;
                values[..gpus].to_vec()
            }
        };

        if seqs.len() != 2 {
            return Err(StrandError::Config(format!(
                "SEQ needs exactly two sequences, got {}",
                seqs.len()
            )));
        }
        if model == BalanceModel::Decision && prog.is_none() {
            return Err(StrandError::Config("MODEL decision requires PROG".into()));
        }
        if model == BalanceModel::Static {
            breakpoints = 0;
        }

        let nodes = (0..gpus)
            .map(|i| NodeSpec {
                device: devices[i],
                address: ips[i].clone(),
                stream_port: ports[i],
            })
            .collect();

        Ok(Self {
            nodes,
            block_pruning,
            breakpoints,
            wait_previous,
            split,
            seq0: PathBuf::from(&seqs[0]),
            seq1: PathBuf::from(&seqs[1]),
            model,
            prog,
            gflops,
        })
    }

    /// Number of workers participating in dynamic mode at load time.
    pub fn dynamic_workers(&self) -> u32 {
        match self.model {
            BalanceModel::Static => 0,
            _ => self.nodes.len() as u32,
        }
    }

    pub fn total_gflops(&self) -> u64 {
        self.gflops.iter().sum()
    }
}

fn parse_scalar<T: FromStr>(key: &str, value: &str) -> Result<T> {
    let token = value.split_whitespace().next().unwrap_or("");
    token
        .parse()
        .map_err(|_| StrandError::Config(format!("{key}: cannot parse '{token}'")))
}

fn parse_list<T: FromStr>(key: &str, value: &str) -> Result<Vec<T>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|tok| !tok.is_empty())
        .map(|tok| {
            tok.parse()
                .map_err(|_| StrandError::Config(format!("{key}: cannot parse '{tok}'")))
        })
        .collect()
}

fn require_len(key: &str, got: usize, gpus: usize) -> Result<()> {
    if got < gpus {
        return Err(StrandError::Config(format!(
            "{key} lists {got} entries but GPUS is {gpus}"
        )));
    }
    Ok(())
}

// ── Host settings ─────────────────────────────────────────────────────────────

/// Site-specific settings that are not part of the run file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSettings {
    /// Address of the machine running the controller. Nodes with this
    /// address are managed locally instead of over ssh.
    pub controller_ip: String,
    /// Remote login used for ssh process control.
    pub ssh_user: String,
    /// Directory (relative to the remote home) holding the launcher binary.
    pub launcher_dir: PathBuf,
    /// Launcher executable name; also the process name killed on recovery.
    pub launcher: String,
    /// Alignment kernel executable passed in every `EXEC` command.
    pub kernel: String,
    /// Control port of a node is `base_port + device`.
    pub base_port: u16,
    /// Offset from `base_port` of the aggregation socket the last stage
    /// reports round progress on.
    pub aggregation_offset: u16,
}

impl HostSettings {
    pub fn aggregation_port(&self) -> u16 {
        self.base_port.saturating_add(self.aggregation_offset)
    }

    /// Process name of the kernel, used for kill-by-name.
    pub fn kernel_process(&self) -> &str {
        Path::new(&self.kernel)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.kernel)
    }
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            controller_ip: "127.0.0.1".into(),
            ssh_user: std::env::var("USER").unwrap_or_else(|_| "strand".into()),
            launcher_dir: PathBuf::from("."),
            launcher: "balancer".into(),
            kernel: "./cudalign".into(),
            base_port: 5200,
            aggregation_offset: 501,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# sample run
GPUS 3
BP 0
BREAK 2
WAIT 1
GPU# 0,1,0
IP 10.0.0.1,10.0.0.1,10.0.0.2
PORT 6000,6001,6002
SPLIT 1
SEQ a.fasta,b.fasta
MODEL dynamic
GFLOPS 10,10,20
";

    #[test]
    fn parses_sample() {
        let cfg = ControllerConfig::parse(SAMPLE).unwrap();
        assert_eq!(cfg.nodes.len(), 3);
        assert_eq!(cfg.nodes[2].address, "10.0.0.2");
        assert_eq!(cfg.nodes[1].device, 1);
        assert_eq!(cfg.nodes[1].stream_port, 6001);
        assert!(!cfg.block_pruning);
        assert!(cfg.wait_previous);
        assert_eq!(cfg.breakpoints, 2);
        assert_eq!(cfg.split, vec![1, 1, 1]);
        assert_eq!(cfg.seq0, PathBuf::from("a.fasta"));
        assert_eq!(cfg.model, BalanceModel::Dynamic);
        assert_eq!(cfg.dynamic_workers(), 3);
        assert_eq!(cfg.total_gflops(), 40);
    }

    #[test]
    fn static_model_forces_single_round() {
        let text = SAMPLE.replace("MODEL dynamic", "MODEL static");
        let cfg = ControllerConfig::parse(&text).unwrap();
        assert_eq!(cfg.breakpoints, 0);
        assert_eq!(cfg.dynamic_workers(), 0);
    }

    #[test]
    fn explicit_split_weights() {
        let text = SAMPLE.replace("SPLIT 1", "SPLIT 4,2,1");
        let cfg = ControllerConfig::parse(&text).unwrap();
        assert_eq!(cfg.split, vec![4, 2, 1]);
    }

    #[test]
    fn short_lists_are_rejected() {
        let text = SAMPLE.replace("PORT 6000,6001,6002", "PORT 6000,6001");
        let err = ControllerConfig::parse(&text).unwrap_err();
        assert!(matches!(err, StrandError::Config(_)));
    }

    #[test]
    fn oversized_device_is_rejected() {
        let text = SAMPLE.replace("GPU# 0,1,0", "GPU# 0,70000,0");
        let err = ControllerConfig::parse(&text).unwrap_err();
        assert!(matches!(err, StrandError::Config(_)));
    }

    #[test]
    fn decision_needs_prog() {
        let text = SAMPLE.replace("MODEL dynamic", "MODEL decision");
        assert!(ControllerConfig::parse(&text).is_err());
        let text = format!("{text}PROG ./decide\n");
        let cfg = ControllerConfig::parse(&text).unwrap();
        assert_eq!(cfg.prog.as_deref(), Some("./decide"));
    }

    #[test]
    fn host_defaults() {
        let host = HostSettings::default();
        assert_eq!(host.aggregation_port(), 5701);
        assert_eq!(host.kernel_process(), "cudalign");
    }
}
