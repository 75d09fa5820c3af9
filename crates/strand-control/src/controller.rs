//! Round driver.
//!
//! Drives `breakpoints + 1` rounds over the fleet. Each round launches one
//! partition per node, waits for the round's last stage to report on the
//! aggregation socket, rebalances the next round's split, and waits for the
//! round to end. Every failure funnels into the same path: drop the
//! aggregation link, resolve the checkpoint ledger, recover the fleet and
//! re-enter the loop at the resume point.
//!
//! ```text
//!            ┌──────────── boundary (round > 0 or after failure) ─────────────┐
//!            │  finish confirmation → ledger: Continue | Recover | Abort      │
//!            └───────────────────────────────┬─────────────────────────────────┘
//!                                            ▼
//!   dispatch EXEC × fleet → accept aggregator → progress → rebalance → progress
//!                                            │ failure at any step
//!                                            └──────────▶ boundary
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use strand_stream::SharedDir;
use strand_types::{BalanceModel, ControllerConfig, HostSettings, WorkDir};

use crate::checkpoint::{Checkpoint, CheckpointLedger, Resolution};
use crate::command::{ControlMessage, ExecCommand, RoundContext};
use crate::decision::{DecisionModule, Verdict};
use crate::detector::{self, FailureDetector, RoundSignal};
use crate::error::{ControlError, Result};
use crate::fleet::{self, FleetState};
use crate::journal::{self, RebalanceJournal};
use crate::policy::ControlPolicies;
use crate::process::ProcessManager;
use crate::recovery::RecoveryManager;
use crate::split::Proposal;
use crate::throughput;

/// Poll spacing while waiting for the aggregation peer to connect.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { elapsed: Duration },
    /// No valid checkpoint was left to resume from.
    Aborted { round: u32 },
}

pub struct Controller<P> {
    run_id: Uuid,
    layout: WorkDir,
    host: HostSettings,
    policies: ControlPolicies,
    state: FleetState,
    ledger: CheckpointLedger,
    detector: FailureDetector,
    recovery: RecoveryManager<P>,
    decision: Option<DecisionModule>,
    journal: RebalanceJournal,
    aggregation_listener: TcpListener,
    aggregation: Option<TcpStream>,
    highest_part: u32,
}

impl<P: ProcessManager> Controller<P> {
    /// Load the run file, bind the aggregation socket and, for
    /// `MODEL decision`, start the decision program and take its verdict.
    pub async fn start(
        config_path: &Path,
        layout: WorkDir,
        host: HostSettings,
        procs: P,
        policies: ControlPolicies,
    ) -> Result<Self> {
        let config = ControllerConfig::load(config_path)?;
        layout.ensure()?;
        let mut state = FleetState::new(config);

        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, host.aggregation_port()));
        let aggregation_listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ControlError::Startup(format!("aggregation socket {addr}: {e}")))?;

        let decision = match (state.config.model, state.config.prog.clone()) {
            (BalanceModel::Decision, Some(prog)) => {
                let budget = state.config.total_gflops() * u64::from(state.breakpoints);
                let module = DecisionModule::launch(
                    &prog,
                    &state.config.seq0,
                    &state.config.seq1,
                    budget,
                    policies.decision_poll,
                )
                .await?;
                if module.initial_verdict().await == Verdict::Veto {
                    info!("decision module disabled dynamic rebalancing");
                    state.disable_dynamic();
                }
                Some(module)
            }
            _ => None,
        };

        let detector = FailureDetector::new(SharedDir::new(layout.share_dir()), policies.detector_interval);
        let recovery = RecoveryManager::new(
            layout.clone(),
            host.clone(),
            config_path.to_path_buf(),
            procs,
            policies.connect,
        );
        let journal = RebalanceJournal::new(layout.rebalance_journal());

        Ok(Self {
            run_id: Uuid::new_v4(),
            layout,
            host,
            policies,
            state,
            ledger: CheckpointLedger::new(),
            detector,
            recovery,
            decision,
            journal,
            aggregation_listener,
            aggregation: None,
            highest_part: 0,
        })
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn state(&self) -> &FleetState {
        &self.state
    }

    pub fn ledger(&self) -> &CheckpointLedger {
        &self.ledger
    }

    pub fn process_manager(&self) -> &P {
        self.recovery.procs()
    }

    pub fn aggregation_addr(&self) -> Result<SocketAddr> {
        Ok(self.aggregation_listener.local_addr()?)
    }

    // ── Round loop ───────────────────────────────────────────────────────

    /// Run the alignment to completion (or abort).
    pub async fn run(&mut self) -> Result<RunOutcome> {
        let span = info_span!("run", run_id = %self.run_id);
        self.drive().instrument(span).await
    }

    async fn drive(&mut self) -> Result<RunOutcome> {
        let started = Instant::now();
        info!(
            nodes = self.state.fleet(),
            breakpoints = self.state.breakpoints,
            model = %self.state.config.model,
            "starting run"
        );

        fleet::connect_fleet(&mut self.state, &self.host, 0, self.policies.connect).await?;
        self.state.init_splits();

        let mut round = 0u32;
        let mut failed = false;

        while round <= self.state.breakpoints {
            if round > 0 || failed {
                if !failed {
                    let part = self.state.part;
                    failed = detector::finish_failed(
                        &self.layout.end_marker(part),
                        &self.layout.second_end_marker(part),
                        self.policies.finish,
                    )
                    .await;
                }
                match self.ledger.resolve(round, failed, &self.state.config.seq0).await {
                    Resolution::Continue => {}
                    Resolution::Recover(resume) => {
                        self.aggregation = None;
                        self.recovery.recover(&mut self.state, resume, self.highest_part).await?;
                        self.highest_part = resume.part;
                        round = resume.round;
                    }
                    Resolution::Abort => {
                        error!(round, "no valid checkpoint to resume from; aborting");
                        self.aggregation = None;
                        self.state.disconnect_all().await;
                        return Ok(RunOutcome::Aborted { round });
                    }
                }
                failed = false;
            }

            self.dispatch_round(round).await;

            if !self.await_aggregator().await? || !self.await_progress().await {
                failed = true;
                continue;
            }
            if round < self.state.breakpoints {
                self.rebalance(round).await;
            }
            if !self.await_progress().await {
                failed = true;
                continue;
            }
            info!(round, part = self.state.part, "round complete");
            round += 1;
        }

        self.finish(started).await
    }

    /// Send one `EXEC` per node and register the round's checkpoint.
    async fn dispatch_round(&mut self, round: u32) {
        let specs = self.state.specs();
        let base = self.state.part;
        let last_part = base + specs.len() as u32;

        let commands: Vec<ExecCommand> = {
            let ctx = RoundContext {
                nodes: &specs,
                layout: &self.layout,
                host: &self.host,
                config: &self.state.config,
                dynamic_workers: self.state.dynamic_workers,
                vgpu: self.state.vgpu,
                split: self.state.splits.as_slice(),
            };
            (0..specs.len())
                .map(|stage| ctx.command(stage, base + 1 + stage as u32))
                .collect()
        };

        let checkpoint = if last_part >= self.state.vgpu {
            Checkpoint::Unavailable
        } else {
            Checkpoint::File {
                path: self.layout.checkpoint_path(last_part),
                round,
                part: last_part,
            }
        };
        self.ledger.register(checkpoint);
        self.state.part = last_part;
        self.highest_part = self.highest_part.max(last_part);

        for (node, cmd) in self.state.nodes.iter_mut().zip(commands) {
            let part = cmd.part;
            if let Err(e) = node.send(&ControlMessage::Exec(cmd)).await {
                warn!(node = %node.spec.address, part, error = %e, "EXEC not delivered");
                self.detector.shared().raise_failure().await;
            }
        }
        info!(
            round,
            first_part = base + 1,
            last_part,
            vgpu = self.state.vgpu,
            "round dispatched"
        );
    }

    /// Accept the last stage's aggregation connection if none is live.
    /// Returns `false` if a failure is signalled first.
    async fn await_aggregator(&mut self) -> Result<bool> {
        if self.aggregation.is_some() {
            return Ok(true);
        }
        loop {
            if self.detector.shared().failure_raised().await {
                warn!("failure signalled before the aggregation peer connected");
                return Ok(false);
            }
            match tokio::time::timeout(ACCEPT_POLL, self.aggregation_listener.accept()).await {
                Err(_) => continue,
                Ok(Ok((stream, peer))) => {
                    info!(%peer, "aggregation peer connected");
                    self.aggregation = Some(stream);
                    return Ok(true);
                }
                Ok(Err(e)) => {
                    return Err(ControlError::Startup(format!("aggregation accept: {e}")));
                }
            }
        }
    }

    /// Wait for one progress report. `false` means a failure was detected
    /// and the aggregation link has been dropped.
    async fn await_progress(&mut self) -> bool {
        let Some(stream) = self.aggregation.as_mut() else {
            return false;
        };
        match self.detector.await_round_signal(stream).await {
            Ok(RoundSignal::Progressed(_)) => true,
            Ok(RoundSignal::FailureDetected) => {
                self.aggregation = None;
                false
            }
            Err(e) => {
                warn!(error = %e, "aggregation link failed");
                self.aggregation = None;
                false
            }
        }
    }

    /// Propose the next round's slice from this round's throughput.
    async fn rebalance(&mut self, round: u32) {
        let fleet = self.state.fleet();
        let start = self.state.part as usize;
        let first = self.state.part + 1 - fleet as u32;

        let mut rates = Vec::with_capacity(fleet);
        for stage in 0..fleet {
            let last_stage = stage + 1 == fleet;
            let log = self.layout.throughput_log(first + stage as u32, last_stage);
            let rate = throughput::read_rate(&log, last_stage, self.policies.throughput_log)
                .await
                .unwrap_or(0.0);
            rates.push(rate);
        }

        let previous = self.state.splits.slice(start - fleet, fleet).to_vec();
        let proposal = self.state.splits.propose(start, fleet, &rates);
        let mut balanced = proposal.balanced;
        if let Some(decision) = &self.decision {
            if decision.round_verdict().await == Verdict::Veto {
                info!(round, "decision module vetoed rebalancing");
                balanced = false;
            }
        }

        if balanced {
            self.state.splits.rebalance(start, fleet);
        } else {
            self.state.splits.carry_forward(start, fleet);
        }
        info!(
            round,
            balanced,
            split = ?self.state.splits.slice(start, fleet),
            "next round split"
        );

        let proposal = Proposal { balanced, ..proposal };
        self.journal
            .record(round, start, &previous, &rates, &proposal, self.state.splits.as_slice())
            .await;
    }

    async fn finish(&mut self, started: Instant) -> Result<RunOutcome> {
        let elapsed = started.elapsed();
        journal::write_statistics(&self.layout.statistics_path(), elapsed).await;
        info!(elapsed_ms = elapsed.as_millis() as u64, "alignment finished");

        tokio::time::sleep(self.policies.shutdown_grace).await;
        for node in &mut self.state.nodes {
            if let Err(e) = node.send(&ControlMessage::End).await {
                warn!(node = %node.spec.address, error = %e, "END not delivered");
            }
        }
        self.state.disconnect_all().await;
        self.aggregation = None;
        Ok(RunOutcome::Completed { elapsed })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::task::JoinHandle;

    use strand_stream::RetryPolicy;
    use strand_types::{Endpoint, CELL_SIZE};

    use crate::process::recording::{Call, RecordingProcessManager};
    use crate::throughput::sample_line;

    const RESIDUES: usize = 64;

    /// Stands in for a launcher plus its kernel: decodes `EXEC`, writes the
    /// partition's throughput log, checkpoint and completion marker, and
    /// reports progress on the aggregation socket when it is the last stage.
    #[derive(Clone)]
    struct FakeKernel {
        rate: f64,
        aggregator: SocketAddr,
        fail_part: Arc<AtomicU32>,
        received: Arc<Mutex<Vec<ExecCommand>>>,
    }

    impl FakeKernel {
        async fn serve(self, listener: TcpListener) {
            while let Ok((conn, _)) = listener.accept().await {
                tokio::spawn(self.clone().session(conn));
            }
        }

        async fn session(self, mut conn: TcpStream) {
            let mut buf = String::new();
            let mut chunk = [0u8; 4096];
            let mut aggregator: Option<TcpStream> = None;
            loop {
                let n = match conn.read(&mut chunk).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                buf.push_str(std::str::from_utf8(&chunk[..n]).unwrap());
                while let Some(end) = message_end(&buf) {
                    let msg: String = buf.drain(..end).collect();
                    match ControlMessage::decode(&msg).unwrap() {
                        ControlMessage::End => return,
                        ControlMessage::Exec(cmd) => self.run_stage(cmd, &mut aggregator).await,
                    }
                }
            }
        }

        async fn run_stage(&self, cmd: ExecCommand, aggregator: &mut Option<TcpStream>) {
            self.received.lock().unwrap().push(cmd.clone());
            std::fs::create_dir_all(&cmd.work_dir).unwrap();
            let last_stage = !matches!(cmd.flush_column, Some(Endpoint::Socket { .. }));

            if last_stage
                && self
                    .fail_part
                    .compare_exchange(cmd.part, 0, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            {
                std::fs::write(cmd.shared_dir.join("failure.txt"), b"").unwrap();
                return;
            }

            if !last_stage {
                let line = sample_line(&[(17, self.rate)]);
                std::fs::write(cmd.work_dir.join("outputBuffer.log"), line).unwrap();
                return;
            }
            let line = sample_line(&[(14, self.rate)]);
            std::fs::write(cmd.work_dir.join("inputBuffer.log"), line).unwrap();
            if let Some(Endpoint::File(path)) = &cmd.flush_column {
                std::fs::write(path, vec![0u8; RESIDUES * CELL_SIZE]).unwrap();
            }
            std::fs::write(cmd.work_dir.join("dynend.txt"), b"").unwrap();
            std::fs::write(cmd.work_dir.join("dynend1.txt"), b"").unwrap();

            if aggregator.is_none() {
                *aggregator = TcpStream::connect(self.aggregator).await.ok();
            }
            if let Some(stream) = aggregator.as_mut() {
                let _ = stream.write_all(b"RDY!FIN!").await;
            }
        }
    }

    fn message_end(buf: &str) -> Option<usize> {
        if buf.starts_with("END|") {
            return Some(4);
        }
        buf.find('&').map(|i| i + 1)
    }

    struct Harness {
        _dir: tempfile::TempDir,
        layout: WorkDir,
        controller: Controller<RecordingProcessManager>,
        received: Vec<Arc<Mutex<Vec<ExecCommand>>>>,
        _fakes: Vec<JoinHandle<()>>,
    }

    impl Harness {
        async fn new(rates: &[f64], breakpoints: u32, fail_part: u32) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let layout = WorkDir::new(dir.path().join("run"));
            let seq0 = dir.path().join("a.fasta");
            let seq1 = dir.path().join("b.fasta");
            let body: String = "ACGT".chars().cycle().take(RESIDUES).collect();
            std::fs::write(&seq0, format!(">a\n{body}\n")).unwrap();
            std::fs::write(&seq1, format!(">b\n{body}\n")).unwrap();

            let mut listeners = Vec::new();
            let mut ports = Vec::new();
            for _ in rates {
                let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
                ports.push(l.local_addr().unwrap().port());
                listeners.push(l);
            }
            let csv = |items: Vec<String>| items.join(",");
            let config = format!(
                "GPUS {n}\nBREAK {breakpoints}\nGPU# {}\nIP {}\nPORT {}\nSPLIT 1\nSEQ {},{}\nMODEL dynamic\n",
                csv(ports.iter().map(u16::to_string).collect()),
                csv(vec!["127.0.0.1".to_string(); rates.len()]),
                csv((0..rates.len()).map(|i| (7000 + i).to_string()).collect()),
                seq0.display(),
                seq1.display(),
                n = rates.len(),
            );
            let config_path: PathBuf = dir.path().join("run.cfg");
            std::fs::write(&config_path, config).unwrap();

            let host = HostSettings {
                base_port: 0,
                aggregation_offset: 0,
                controller_ip: "127.0.0.1".into(),
                ..HostSettings::default()
            };
            let policies = ControlPolicies {
                throughput_log: RetryPolicy::new(400, Duration::from_millis(5)),
                ..ControlPolicies::fast()
            };
            let controller = Controller::start(
                &config_path,
                layout.clone(),
                host,
                RecordingProcessManager::default(),
                policies,
            )
            .await
            .unwrap();

            let port = controller.aggregation_addr().unwrap().port();
            let aggregator = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
            let fail_part = Arc::new(AtomicU32::new(fail_part));
            let mut received = Vec::new();
            let mut fakes = Vec::new();
            for (listener, rate) in listeners.into_iter().zip(rates) {
                let kernel = FakeKernel {
                    rate: *rate,
                    aggregator,
                    fail_part: fail_part.clone(),
                    received: Arc::default(),
                };
                received.push(kernel.received.clone());
                fakes.push(tokio::spawn(kernel.serve(listener)));
            }

            Self { _dir: dir, layout, controller, received, _fakes: fakes }
        }

        fn commands(&self, node: usize) -> Vec<ExecCommand> {
            self.received[node].lock().unwrap().clone()
        }

        /// Interior stages are never awaited by the controller; give their
        /// fakes a moment to record the last round.
        async fn wait_for_commands(&self, node: usize, count: usize) -> Vec<ExecCommand> {
            for _ in 0..200 {
                let commands = self.commands(node);
                if commands.len() >= count {
                    return commands;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            self.commands(node)
        }
    }

    #[tokio::test]
    async fn two_rounds_chain_through_checkpoints() {
        let mut h = Harness::new(&[1.0, 1.0], 1, 0).await;
        let outcome = h.controller.run().await.unwrap();
        assert!(matches!(outcome, RunOutcome::Completed { .. }));

        let first = h.wait_for_commands(0, 2).await;
        let second = h.commands(1);
        assert_eq!(first.iter().map(|c| c.part).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(second.iter().map(|c| c.part).collect::<Vec<_>>(), vec![2, 4]);

        assert_eq!(first[0].load_column, None);
        assert_eq!(second[0].flush_column, Some(Endpoint::File(h.layout.checkpoint_path(2))));
        assert_eq!(first[1].load_column, Some(Endpoint::File(h.layout.checkpoint_path(2))));
        assert_eq!(second[1].flush_column, None);
        assert_eq!(first[1].split, vec![500, 500, 500, 500]);

        assert!(h.layout.statistics_path().exists());
        assert!(h.layout.rebalance_journal().exists());
        assert!(h.controller.process_manager().calls().is_empty());
    }

    #[tokio::test]
    async fn faster_stage_gets_more_work() {
        let mut h = Harness::new(&[1.0, 1.0, 2.0, 1.0], 2, 0).await;
        let outcome = h.controller.run().await.unwrap();
        assert!(matches!(outcome, RunOutcome::Completed { .. }));

        let splits = &h.controller.state().splits;
        assert_eq!(splits.slice(0, 4), &[250, 250, 250, 250]);
        assert_eq!(splits.slice(4, 4), &[200, 200, 400, 200]);
        // Doubling stage 2 again would swing too far; the split is kept.
        assert_eq!(splits.slice(8, 4), &[200, 200, 400, 200]);
    }

    #[tokio::test]
    async fn failed_round_is_retried_from_previous_checkpoint() {
        let mut h = Harness::new(&[1.0, 1.0, 2.0, 1.0], 2, 8).await;
        let outcome = h.controller.run().await.unwrap();
        assert!(matches!(outcome, RunOutcome::Completed { .. }));

        let parts: Vec<u32> = h.commands(3).iter().map(|c| c.part).collect();
        assert_eq!(parts, vec![4, 8, 8, 12]);
        assert_eq!(h.controller.state().part, 12);
        assert!(!h.layout.failure_path().exists());
        assert_eq!(h.controller.state().splits.slice(4, 4), &[200, 200, 400, 200]);

        let calls = h.controller.process_manager().calls();
        let kills = calls.iter().filter(|c| matches!(c, Call::Kill { .. })).count();
        let spawns = calls.iter().filter(|c| matches!(c, Call::Spawn { .. })).count();
        assert_eq!(kills, 8);
        assert_eq!(spawns, 4);
    }

    #[tokio::test]
    async fn unreachable_fleet_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = l.local_addr().unwrap().port();
        drop(l);
        let config_path = dir.path().join("run.cfg");
        std::fs::write(
            &config_path,
            format!("GPUS 1\nGPU# {port}\nIP 127.0.0.1\nPORT 7000\nSEQ a.fasta,b.fasta\n"),
        )
        .unwrap();
        let host = HostSettings { base_port: 0, aggregation_offset: 0, ..HostSettings::default() };

        let mut controller = Controller::start(
            &config_path,
            WorkDir::new(dir.path().join("run")),
            host,
            RecordingProcessManager::default(),
            ControlPolicies::fast(),
        )
        .await
        .unwrap();
        let err = controller.run().await.unwrap_err();
        assert!(matches!(err, ControlError::FleetExhausted));
    }
}
