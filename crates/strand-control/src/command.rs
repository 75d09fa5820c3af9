//! Controller → launcher messages and the per-stage command builder.
//!
//! Messages are plain text on the control socket, one write per message:
//!
//! ```text
//! EXEC|<kernel> --blocks=512 --clear --no-flush --stage-1 --shared-dir=<W>/share
//!      --work-dir=<W>/work<part> --dynamic=<n> [--wait-part=<p>] [--no-block-pruning]
//!      --split=<w,w,…> [--load-column=<endpoint>] [--flush-column=<endpoint>]
//!      --gpu=<device> --part=<part> <seq0> <seq1> &
//! END|
//! ```
//!
//! Stage topology within one round of `fleet` stages:
//!
//! ```text
//!  out<p-1>.bin ──▶ stage 0 ──socket──▶ stage 1 ──socket──▶ … ──▶ stage n-1 ──▶ out<p>.bin
//! ```
//!
//! Partition 1 has no column source and the final partition has no sink.

use std::path::PathBuf;

use strand_types::{ControllerConfig, Endpoint, HostSettings, NodeSpec, WorkDir};

use crate::error::{ControlError, Result};

const EXEC_PREFIX: &str = "EXEC|";
const END_MESSAGE: &str = "END|";
const FIXED_FLAGS: [&str; 4] = ["--blocks=512", "--clear", "--no-flush", "--stage-1"];

// ── Messages ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCommand {
    pub kernel: String,
    pub shared_dir: PathBuf,
    pub work_dir: PathBuf,
    pub dynamic_workers: u32,
    pub wait_part: Option<u32>,
    pub block_pruning: bool,
    /// Every virtual partition's weight, not just this round's.
    pub split: Vec<u32>,
    pub load_column: Option<Endpoint>,
    pub flush_column: Option<Endpoint>,
    pub device: u32,
    pub part: u32,
    pub seq0: PathBuf,
    pub seq1: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Exec(ExecCommand),
    End,
}

impl ControlMessage {
    pub fn encode(&self) -> String {
        match self {
            Self::Exec(cmd) => format!("{EXEC_PREFIX}{}", cmd.command_line()),
            Self::End => END_MESSAGE.to_string(),
        }
    }

    pub fn decode(text: &str) -> Result<Self> {
        let text = text.trim();
        if text == END_MESSAGE {
            return Ok(Self::End);
        }
        let line = text
            .strip_prefix(EXEC_PREFIX)
            .ok_or_else(|| ControlError::Protocol(format!("unknown message '{text}'")))?;
        ExecCommand::parse(line).map(Self::Exec)
    }
}

impl ExecCommand {
    /// The launcher's shell command line (without the `EXEC|` prefix).
    pub fn command_line(&self) -> String {
        let mut args: Vec<String> = vec![self.kernel.clone()];
        args.extend(FIXED_FLAGS.iter().map(|f| f.to_string()));
        args.push(format!("--shared-dir={}", self.shared_dir.display()));
        args.push(format!("--work-dir={}", self.work_dir.display()));
        args.push(format!("--dynamic={}", self.dynamic_workers));
        if let Some(wait) = self.wait_part {
            args.push(format!("--wait-part={wait}"));
        }
        if !self.block_pruning {
            args.push("--no-block-pruning".into());
        }
        let split: Vec<String> = self.split.iter().map(u32::to_string).collect();
        args.push(format!("--split={}", split.join(",")));
        if let Some(load) = &self.load_column {
            args.push(format!("--load-column={load}"));
        }
        if let Some(flush) = &self.flush_column {
            args.push(format!("--flush-column={flush}"));
        }
        args.push(format!("--gpu={}", self.device));
        args.push(format!("--part={}", self.part));
        args.push(self.seq0.display().to_string());
        args.push(self.seq1.display().to_string());
        args.push("&".into());
        args.join(" ")
    }

    fn parse(line: &str) -> Result<Self> {
        let mut tokens = line.split_whitespace();
        let kernel = tokens
            .next()
            .ok_or_else(|| ControlError::Protocol("EXEC without a kernel".into()))?
            .to_string();

        let mut cmd = ExecCommand {
            kernel,
            shared_dir: PathBuf::new(),
            work_dir: PathBuf::new(),
            dynamic_workers: 0,
            wait_part: None,
            block_pruning: true,
            split: Vec::new(),
            load_column: None,
            flush_column: None,
            device: 0,
            part: 0,
            seq0: PathBuf::new(),
            seq1: PathBuf::new(),
        };
        let mut positional = Vec::new();

        for token in tokens {
            if FIXED_FLAGS.contains(&token) || token == "&" {
                continue;
            }
            if token == "--no-block-pruning" {
                cmd.block_pruning = false;
                continue;
            }
            let Some(flag) = token.strip_prefix("--") else {
                positional.push(token);
                continue;
            };
            let (name, value) = flag
                .split_once('=')
                .ok_or_else(|| ControlError::Protocol(format!("flag '{token}' has no value")))?;
            match name {
                "shared-dir" => cmd.shared_dir = PathBuf::from(value),
                "work-dir" => cmd.work_dir = PathBuf::from(value),
                "dynamic" => cmd.dynamic_workers = number(name, value)?,
                "wait-part" => cmd.wait_part = Some(number(name, value)?),
                "split" => {
                    cmd.split = value
                        .split(',')
                        .map(|w| number(name, w))
                        .collect::<Result<_>>()?
                }
                "load-column" => cmd.load_column = Some(value.parse()?),
                "flush-column" => cmd.flush_column = Some(value.parse()?),
                "gpu" => cmd.device = number(name, value)?,
                "part" => cmd.part = number(name, value)?,
                _ => return Err(ControlError::Protocol(format!("unknown flag '{token}'"))),
            }
        }

        match positional.as_slice() {
            [seq0, seq1] => {
                cmd.seq0 = PathBuf::from(seq0);
                cmd.seq1 = PathBuf::from(seq1);
                Ok(cmd)
            }
            other => Err(ControlError::Protocol(format!(
                "EXEC needs two sequences, got {}",
                other.len()
            ))),
        }
    }
}

fn number(flag: &str, value: &str) -> Result<u32> {
    value
        .parse()
        .map_err(|_| ControlError::Protocol(format!("--{flag}: bad number '{value}'")))
}

// ── Stage topology ───────────────────────────────────────────────────────────

/// Everything needed to build the commands of one round.
#[derive(Debug, Clone, Copy)]
pub struct RoundContext<'a> {
    /// Live fleet in pipeline order.
    pub nodes: &'a [NodeSpec],
    pub layout: &'a WorkDir,
    pub host: &'a HostSettings,
    pub config: &'a ControllerConfig,
    pub dynamic_workers: u32,
    /// Total number of virtual partitions.
    pub vgpu: u32,
    pub split: &'a [u32],
}

impl RoundContext<'_> {
    pub fn fleet(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_last_stage(&self, stage: usize) -> bool {
        stage + 1 == self.fleet()
    }

    /// Column source of `stage` computing partition `part`.
    pub fn load_column(&self, stage: usize, part: u32) -> Option<Endpoint> {
        if part <= 1 {
            None
        } else if stage == 0 {
            Some(Endpoint::File(self.layout.checkpoint_path(part - 1)))
        } else {
            let upstream = &self.nodes[stage - 1];
            Some(Endpoint::socket(&upstream.address, upstream.stream_port))
        }
    }

    /// Column sink of `stage` computing partition `part`. Stage `i` listens on
    /// its own stream port; the address is that of the next stage.
    pub fn flush_column(&self, stage: usize, part: u32) -> Option<Endpoint> {
        if part >= self.vgpu {
            None
        } else if self.is_last_stage(stage) {
            Some(Endpoint::File(self.layout.checkpoint_path(part)))
        } else {
            let downstream = &self.nodes[stage + 1];
            Some(Endpoint::socket(&downstream.address, self.nodes[stage].stream_port))
        }
    }

    pub fn command(&self, stage: usize, part: u32) -> ExecCommand {
        let fleet = self.fleet() as u32;
        let wait_part = (self.config.wait_previous && part > fleet).then(|| part - fleet);
        ExecCommand {
            kernel: self.host.kernel.clone(),
            shared_dir: self.layout.share_dir(),
            work_dir: self.layout.partition_dir(part),
            dynamic_workers: self.dynamic_workers,
            wait_part,
            block_pruning: self.config.block_pruning,
            split: self.split[..(self.vgpu as usize).min(self.split.len())].to_vec(),
            load_column: self.load_column(stage, part),
            flush_column: self.flush_column(stage, part),
            device: self.nodes[stage].device,
            part,
            seq0: self.config.seq0.clone(),
            seq1: self.config.seq1.clone(),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = "\
GPUS 3
BREAK 1
WAIT 1
GPU# 0,1,0
IP 10.0.0.1,10.0.0.1,10.0.0.2
PORT 6000,6001,6002
SEQ a.fasta,b.fasta
";

    fn with_context<T>(f: impl FnOnce(RoundContext<'_>) -> T) -> T {
        let config = ControllerConfig::parse(CONFIG).unwrap();
        let layout = WorkDir::new("/w");
        let host = HostSettings::default();
        let split = vec![334, 333, 333, 334, 333, 333];
        f(RoundContext {
            nodes: &config.nodes,
            layout: &layout,
            host: &host,
            config: &config,
            dynamic_workers: 3,
            vgpu: 6,
            split: &split,
        })
    }

    #[test]
    fn first_round_topology() {
        with_context(|ctx| {
            assert_eq!(ctx.load_column(0, 1), None);
            assert_eq!(ctx.flush_column(0, 1), Some(Endpoint::socket("10.0.0.1", 6000)));
            assert_eq!(ctx.load_column(1, 2), Some(Endpoint::socket("10.0.0.1", 6000)));
            assert_eq!(ctx.flush_column(1, 2), Some(Endpoint::socket("10.0.0.2", 6001)));
            assert_eq!(ctx.load_column(2, 3), Some(Endpoint::socket("10.0.0.1", 6001)));
            assert_eq!(
                ctx.flush_column(2, 3),
                Some(Endpoint::File(PathBuf::from("/w/share/out3.bin")))
            );
        });
    }

    #[test]
    fn later_round_resumes_from_checkpoint() {
        with_context(|ctx| {
            assert_eq!(
                ctx.load_column(0, 4),
                Some(Endpoint::File(PathBuf::from("/w/share/out3.bin")))
            );
            assert_eq!(ctx.flush_column(2, 6), None);
        });
    }

    #[test]
    fn wait_part_only_after_first_round() {
        with_context(|ctx| {
            assert_eq!(ctx.command(0, 1).wait_part, None);
            assert_eq!(ctx.command(1, 5).wait_part, Some(2));
        });
    }

    #[test]
    fn exec_line_layout() {
        with_context(|ctx| {
            let line = ControlMessage::Exec(ctx.command(0, 4)).encode();
            assert!(line.starts_with(
                "EXEC|./cudalign --blocks=512 --clear --no-flush --stage-1 --shared-dir=/w/share"
            ));
            assert!(line.contains(" --work-dir=/w/work4 --dynamic=3 --wait-part=1 "));
            assert!(line.contains(" --split=334,333,333,334,333,333 "));
            assert!(line.contains(" --load-column=file:///w/share/out3.bin "));
            assert!(line.contains(" --flush-column=socket://10.0.0.1:6000 "));
            assert!(line.ends_with(" --gpu=0 --part=4 a.fasta b.fasta &"));
            assert!(!line.contains("--no-block-pruning"));
        });
    }

    #[test]
    fn decode_recovers_command() {
        with_context(|ctx| {
            let cmd = ctx.command(1, 5);
            let decoded = ControlMessage::decode(&ControlMessage::Exec(cmd.clone()).encode()).unwrap();
            assert_eq!(decoded, ControlMessage::Exec(cmd));
        });
        assert_eq!(ControlMessage::decode("END|").unwrap(), ControlMessage::End);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(ControlMessage::decode("HELLO|").is_err());
        assert!(ControlMessage::decode("EXEC|./k --part=x a b").is_err());
        assert!(ControlMessage::decode("EXEC|./k --part=1 a").is_err());
    }
}
