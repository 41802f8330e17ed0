// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use debugger::{Breakpoint, BreakpointTable, Signal, Target, WaitOutcome};
use snapshot::{egg, Snapshot};

use crate::blocks;
use crate::corpus::Corpus;
use crate::mutator::Mutator;

/// Session configuration, handed over by the CLI.
#[derive(Clone, Debug)]
pub struct Config {
    /// Path of the target executable. It is run with the corpus input file as
    /// its single argument.
    pub target: PathBuf,

    /// Load address of the target's text segment. Block-file offsets are
    /// relative to it.
    pub base_address: u64,

    /// File listing one basic-block offset per line.
    pub blocks: PathBuf,

    /// Absolute address to capture the snapshot at. Given together with
    /// `restore_address`, selects snapshot mode.
    pub snapshot_address: Option<u64>,

    /// Absolute address whose trap ends an iteration and rewinds the child.
    pub restore_address: Option<u64>,

    /// RNG seed, for reproducible runs.
    pub seed: u64,

    /// Stop after this many fuzz cases; fuzz until interrupted when absent.
    pub iterations: Option<u64>,
}

/// Session counters, driven by the single wall clock started at fuzz-loop
/// entry.
#[derive(Clone, Debug)]
pub struct Stats {
    pub fuzz_cases: u64,
    pub crashes: u64,
    started: Instant,
}

impl Stats {
    fn new() -> Self {
        Self {
            fuzz_cases: 0,
            crashes: 0,
            started: Instant::now(),
        }
    }

    pub fn cases_per_second(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();

        if elapsed > 0.0 {
            self.fuzz_cases as f64 / elapsed
        } else {
            0.0
        }
    }
}

const STATS_INTERVAL: u64 = 1000;

/// Consecutive unexpected exits tolerated in snapshot mode before giving up.
const MAX_LOST_RUNS: u32 = 100;

/// What a single run of the child told us.
enum RunOutcome {
    /// The child reached the restore point, or exited in spawn mode.
    Finished,

    /// The child faulted with the given signal.
    Crashed(Signal),

    /// The child exited while a snapshot run expected it to keep going.
    Lost,
}

/// Owns every piece of fuzzing state and drives the whole loop: select a
/// case, mutate, place it, run the child through its breakpoints, harvest
/// coverage, and grow the corpus.
pub struct Session<C> {
    config: Config,
    corpus: C,
    mutator: Mutator,
    table: BreakpointTable,
    addresses: Vec<u64>,
    current_case: Vec<u8>,
    prev_hits: usize,
    stats: Stats,
}

impl<C: Corpus> Session<C> {
    pub fn new(config: Config, corpus: C) -> Result<Self> {
        if corpus.count() == 0 {
            bail!("corpus is empty; seed it with at least one input");
        }

        let max_len = corpus.max_len();
        if max_len == 0 {
            bail!("every corpus entry is empty");
        }

        let offsets = blocks::load(&config.blocks)?;
        if offsets.is_empty() {
            bail!("block file {} lists no offsets", config.blocks.display());
        }

        let addresses = offsets
            .iter()
            .map(|offset| config.base_address + offset)
            .collect();

        let mutator = Mutator::new(config.seed);

        // Reused for every case. Shorter corpus entries are copied into the
        // front; the tail keeps whatever the previous iteration left behind.
        let current_case = vec![0u8; max_len];

        Ok(Self {
            config,
            corpus,
            mutator,
            table: BreakpointTable::default(),
            addresses,
            current_case,
            prev_hits: 0,
            stats: Stats::new(),
        })
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn corpus(&self) -> &C {
        &self.corpus
    }

    /// Coverage progress as (hit, total) breakpoint counts.
    pub fn coverage(&self) -> (usize, usize) {
        (self.table.hits(), self.table.total())
    }

    pub fn run(&mut self) -> Result<()> {
        match (self.config.snapshot_address, self.config.restore_address) {
            (Some(snapshot), Some(restore)) => self.run_snapshot(snapshot, restore),
            (None, None) => self.run_spawn(),
            _ => bail!("snapshot and restore addresses must be given together"),
        }
    }

    /// Snapshot mode: one long-lived child, rewound between cases.
    fn run_snapshot(&mut self, snapshot_addr: u64, restore_addr: u64) -> Result<()> {
        info!(
            "snapshot mode: snapshot at {:x}, restore at {:x}",
            snapshot_addr, restore_addr
        );

        // The egg stands in for the nominal input so every in-memory copy of
        // it can be found and replaced once the child is live.
        let egg_payload = egg::pattern(self.corpus.max_len());

        let (mut target, mut snap, mut restore_bp, mut egg_addresses) =
            self.attach(snapshot_addr, restore_addr, &egg_payload)?;

        self.stats = Stats::new();
        let mut lost_runs = 0u32;

        while !self.done() {
            self.next_case();

            for &addr in &egg_addresses {
                target
                    .write_memory(addr, &self.current_case)
                    .with_context(|| format!("writing case into egg buffer at {:x}", addr))?;
            }

            let mut case_kept = false;

            match self.run_child(&mut target, Some(restore_addr))? {
                RunOutcome::Finished => {
                    lost_runs = 0;
                }
                RunOutcome::Crashed(signal) => {
                    lost_runs = 0;
                    self.record_crash(signal)?;
                    case_kept = true;

                    // The restored child must not receive the fault signal of
                    // its previous life.
                    target.suppress_pending_signal()?;
                }
                RunOutcome::Lost => {
                    lost_runs += 1;
                    if lost_runs >= MAX_LOST_RUNS {
                        bail!(
                            "child exited {} times in a row; is the restore address reachable?",
                            lost_runs
                        );
                    }

                    warn!("child exited under snapshot mode; respawning");

                    let attached = self.attach(snapshot_addr, restore_addr, &egg_payload)?;
                    target = attached.0;
                    snap = attached.1;
                    restore_bp = attached.2;
                    egg_addresses = attached.3;

                    continue;
                }
            }

            snap.restore(target.tracee_mut()?)
                .context("restoring snapshot")?;
            self.table.reinstall_all(&mut target)?;
            restore_bp.rearm(&mut target)?;

            self.finish_iteration(case_kept)?;
        }

        self.log_stats();

        Ok(())
    }

    /// Spawn mode: a fresh child per case, fed through the input file.
    fn run_spawn(&mut self) -> Result<()> {
        info!("spawn mode");

        self.stats = Stats::new();

        while !self.done() {
            self.next_case();

            fs::write(self.corpus.input_path(), &self.current_case).with_context(|| {
                format!("writing case to {}", self.corpus.input_path().display())
            })?;

            let mut cmd = Command::new(&self.config.target);
            cmd.arg(self.corpus.input_path());
            let mut target = Target::spawn(cmd)?;

            if self.table.total() == 0 {
                // The first spawn peeks and saves original bytes. Later
                // spawns re-arm only the still-unseen addresses, so coverage
                // is never re-counted.
                self.install_coverage(&mut target, &[])?;
                info!("installed {} breakpoints", self.table.total());
            } else {
                self.table.reinstall_all(&mut target)?;
            }

            let mut case_kept = false;

            if let RunOutcome::Crashed(signal) = self.run_child(&mut target, None)? {
                self.record_crash(signal)?;
                case_kept = true;
            }

            self.finish_iteration(case_kept)?;
        }

        self.log_stats();

        Ok(())
    }

    /// Spawn the target, drive it to the snapshot site, and set up the fuzz
    /// surface. The ordering is load-bearing: the snapshot trap is retired
    /// first, then the restore trap and the coverage set are armed, and only
    /// then is the snapshot captured, so the captured memory holds no stray
    /// `int3` from the setup itself.
    fn attach(
        &mut self,
        snapshot_addr: u64,
        restore_addr: u64,
        egg_payload: &[u8],
    ) -> Result<(Target, Snapshot, Breakpoint, Vec<u64>)> {
        fs::write(self.corpus.input_path(), egg_payload).with_context(|| {
            format!("writing egg payload to {}", self.corpus.input_path().display())
        })?;

        let mut cmd = Command::new(&self.config.target);
        cmd.arg(self.corpus.input_path());
        let mut target = Target::spawn(cmd)?;

        let mut snapshot_bp = Breakpoint::new(snapshot_addr);
        snapshot_bp.set(&mut target)?;

        match target.resume()? {
            WaitOutcome::Stopped(Signal::SIGTRAP) => {}
            other => bail!("child never reached the snapshot address: {:?}", other),
        }

        let pc = target.registers()?.rip.wrapping_sub(1);
        if pc != snapshot_addr {
            bail!(
                "expected trap at snapshot address {:x}, got {:x}",
                snapshot_addr,
                pc
            );
        }

        snapshot_bp.clear(&mut target)?;
        target.rewind_ip()?;

        let mut restore_bp = Breakpoint::new(restore_addr);
        restore_bp.set(&mut target)?;

        // Only the first attach peeks and saves original bytes. On a respawn
        // the table already holds the still-unseen set, and re-installing
        // would resurrect retired sites so they could be counted again.
        if self.table.total() == 0 {
            self.install_coverage(&mut target, &[snapshot_addr, restore_addr])?;
        }

        // Re-arm the still-unseen set in the fresh child.
        self.table.reinstall_all(&mut target)?;

        info!(
            "armed {} coverage breakpoints ({} already hit)",
            self.table.remaining(),
            self.table.hits()
        );

        let snap = Snapshot::capture(target.tracee_mut()?).context("capturing snapshot")?;
        info!("snapshot captured: {} writable regions", snap.regions.len());

        let egg_addresses = snap.locate_egg(egg_payload)?;
        info!("located {} egg buffers", egg_addresses.len());

        Ok((target, snap, restore_bp, egg_addresses))
    }

    /// Arm every block address except the control sites. The restore address
    /// is never a coverage breakpoint.
    fn install_coverage(&mut self, target: &mut Target, skip: &[u64]) -> Result<()> {
        for &addr in &self.addresses {
            if skip.contains(&addr) {
                continue;
            }

            self.table.install(target, addr)?;
        }

        Ok(())
    }

    /// Drive the child until it exits, crashes, or reaches the restore point,
    /// consuming breakpoint traps along the way. Each hit is retired so the
    /// site never counts twice.
    fn run_child(&mut self, target: &mut Target, restore_addr: Option<u64>) -> Result<RunOutcome> {
        loop {
            match target.resume()? {
                WaitOutcome::Exited(code) => {
                    trace!("child exited: {:?}", code);

                    let outcome = if restore_addr.is_some() {
                        RunOutcome::Lost
                    } else {
                        RunOutcome::Finished
                    };

                    return Ok(outcome);
                }
                WaitOutcome::Stopped(Signal::SIGTRAP) => {
                    let pc = target.registers()?.rip.wrapping_sub(1);

                    // The restore site is checked before the table; it is
                    // never a coverage breakpoint.
                    if restore_addr == Some(pc) {
                        return Ok(RunOutcome::Finished);
                    }

                    if self.table.retire(target, pc)? {
                        target.rewind_ip()?;
                        trace!(
                            "coverage hit at {:x} ({}/{})",
                            pc,
                            self.table.hits(),
                            self.table.total()
                        );
                    } else {
                        bail!(
                            "trap at {:x}, which is neither a breakpoint nor the restore point",
                            pc
                        );
                    }
                }
                WaitOutcome::Stopped(signal) if is_fault(signal) => {
                    return Ok(RunOutcome::Crashed(signal));
                }
                WaitOutcome::Stopped(signal) => {
                    // Not ours; re-delivered to the child on the next resume.
                    warn!("unexpected stop: {:?}", signal);
                }
            }
        }
    }

    /// Select a corpus entry and mutate it into the working buffer.
    fn next_case(&mut self) {
        let index = self.mutator.pick(self.corpus.count());
        let entry = self.corpus.get(index);

        self.current_case[..entry.len()].copy_from_slice(entry);
        self.mutator.mutate(&mut self.current_case);
    }

    fn record_crash(&mut self, signal: Signal) -> Result<()> {
        self.stats.crashes += 1;

        let path = self.corpus.write_crash(&self.current_case)?;
        self.corpus.add(&self.current_case)?;

        warn!("crash ({:?}) recorded at {}", signal, path.display());

        Ok(())
    }

    /// Close out one fuzz case: bump counters and promote the case when it
    /// reached new coverage (unless a crash already promoted it).
    fn finish_iteration(&mut self, case_kept: bool) -> Result<()> {
        self.stats.fuzz_cases += 1;

        let hits = self.table.hits();
        if hits > self.prev_hits {
            if !case_kept {
                self.corpus.add(&self.current_case)?;
                info!(
                    "new coverage ({}/{}); corpus grew to {}",
                    hits,
                    self.table.total(),
                    self.corpus.count()
                );
            }

            self.prev_hits = hits;
        }

        if self.stats.fuzz_cases % STATS_INTERVAL == 0 {
            self.log_stats();
        }

        Ok(())
    }

    fn log_stats(&self) {
        info!(
            "cases: {} | crashes: {} | coverage: {}/{} | {:.1} cases/sec",
            self.stats.fuzz_cases,
            self.stats.crashes,
            self.table.hits(),
            self.table.total(),
            self.stats.cases_per_second(),
        );
    }

    fn done(&self) -> bool {
        match self.config.iterations {
            Some(limit) => self.stats.fuzz_cases >= limit,
            None => false,
        }
    }
}

fn is_fault(signal: Signal) -> bool {
    matches!(signal, Signal::SIGSEGV | Signal::SIGBUS | Signal::SIGABRT)
}
