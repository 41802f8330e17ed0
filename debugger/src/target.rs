// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::process::{Child, Command, Stdio};

use anyhow::{bail, Context, Result};
use libc::user_regs_struct;
use pete::{Ptracer, Restart, Signal, Stop, Tracee};

/// Why the child stopped running after a `resume` or `step`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The child is gone, with its exit code when one was observed.
    Exited(Option<i32>),

    /// The child is stopped on signal delivery and can be inspected, patched,
    /// and resumed.
    Stopped(Signal),
}

/// A child process run under ptrace, stopped-by-default.
///
/// The only component that touches the child's registers or memory. All
/// memory access goes through the tracee's `/proc/<pid>/mem`, which works in
/// bulk for whole regions and also lets us patch non-writable text.
pub struct Target {
    tracer: Ptracer,
    child: Child,
    tracee: Option<Tracee>,
    exit_code: Option<i32>,
}

impl Target {
    /// Execute `cmd` traced, with stdout and stderr discarded, and wait for
    /// the stop at the return of its initial `execve()`. The child is left
    /// quiescent at its entry point, ready for patching.
    pub fn spawn(mut cmd: Command) -> Result<Self> {
        use pete::ptracer::Options;

        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());

        let mut tracer = Ptracer::new();
        let child = tracer.spawn(cmd).context("spawning traced child")?;

        let mut tracee = continue_to_init_execve(&mut tracer)?;

        // Do not follow forks.
        //
        // After this, we assume the only tracee is the process we spawned.
        let mut options = Options::all();
        options.remove(Options::PTRACE_O_TRACEFORK);
        options.remove(Options::PTRACE_O_TRACEVFORK);
        options.remove(Options::PTRACE_O_TRACEEXEC);
        tracee
            .set_options(options)
            .context("setting tracee options")?;

        Ok(Self {
            tracer,
            child,
            tracee: Some(tracee),
            exit_code: None,
        })
    }

    pub fn pid(&self) -> i32 {
        self.child.id() as i32
    }

    /// The current stopped tracee. Errors if the child has exited.
    pub fn tracee_mut(&mut self) -> Result<&mut Tracee> {
        match self.tracee.as_mut() {
            Some(tracee) => Ok(tracee),
            None => bail!("tracee has exited"),
        }
    }

    pub fn read_memory(&mut self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let tracee = self.tracee_mut()?;
        let data = tracee.read_memory(addr, len)?;
        Ok(data)
    }

    pub fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        let tracee = self.tracee_mut()?;
        tracee.write_memory(addr, data)?;
        Ok(())
    }

    pub fn registers(&mut self) -> Result<user_regs_struct> {
        let regs = self.tracee_mut()?.registers()?;
        Ok(regs)
    }

    pub fn set_registers(&mut self, regs: user_regs_struct) -> Result<()> {
        self.tracee_mut()?.set_registers(regs)?;
        Ok(())
    }

    /// Move the instruction pointer back over a trapped `int3`. After a
    /// software-interrupt stop on x86-64, `rip` points one past the `0xcc`
    /// byte, so the original instruction must be re-executed from `rip - 1`.
    /// Returns the rewound pc.
    pub fn rewind_ip(&mut self) -> Result<u64> {
        let tracee = self.tracee_mut()?;
        let mut regs = tracee.registers()?;
        regs.rip -= 1;
        tracee.set_registers(regs)?;
        Ok(regs.rip)
    }

    /// Drop a pending signal so it is not re-delivered on the next resume.
    /// Used after recording a crash in snapshot mode: the restored child must
    /// not receive the fault signal of its previous life.
    pub fn suppress_pending_signal(&mut self) -> Result<()> {
        self.tracee_mut()?.pending = None;
        Ok(())
    }

    /// Resume the stopped child and block until the next signal stop or exit.
    pub fn resume(&mut self) -> Result<WaitOutcome> {
        self.restart_and_wait(Restart::Continue)
    }

    /// Resume for exactly one instruction.
    pub fn step(&mut self) -> Result<WaitOutcome> {
        self.restart_and_wait(Restart::Step)
    }

    fn restart_and_wait(&mut self, how: Restart) -> Result<WaitOutcome> {
        let tracee = match self.tracee.take() {
            Some(tracee) => tracee,
            None => return Ok(WaitOutcome::Exited(self.exit_code)),
        };

        self.tracer.restart(tracee, how).context("restarting tracee")?;

        loop {
            let tracee = match self.tracer.wait().context("waiting for tracee")? {
                Some(tracee) => tracee,
                None => {
                    // No tracees left. Reap the child so the exit code is
                    // available even when no exit event stop was seen.
                    if self.exit_code.is_none() {
                        if let Ok(status) = self.child.wait() {
                            self.exit_code = status.code();
                        }
                    }

                    return Ok(WaitOutcome::Exited(self.exit_code));
                }
            };

            match tracee.stop {
                Stop::SignalDelivery { signal } | Stop::Group { signal } => {
                    self.tracee = Some(tracee);
                    return Ok(WaitOutcome::Stopped(signal));
                }
                Stop::Exiting { exit_code } => {
                    self.exit_code = Some(exit_code);

                    self.tracer
                        .restart(tracee, Restart::Continue)
                        .context("restarting exiting tracee")?;
                }
                _ => {
                    debug!("stop: {:?}", tracee.stop);

                    self.tracer
                        .restart(tracee, Restart::Continue)
                        .context("restarting tracee after event stop")?;
                }
            }
        }
    }
}

impl Drop for Target {
    fn drop(&mut self) {
        // These are no-ops once the child has exited, but we really want to
        // avoid any dangling or zombie child processes.
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn continue_to_init_execve(tracer: &mut Ptracer) -> Result<Tracee> {
    while let Some(tracee) = tracer.wait()? {
        if let Stop::SyscallExit = &tracee.stop {
            return Ok(tracee);
        }

        tracer
            .restart(tracee, Restart::Continue)
            .context("restarting tracee pre-execve()")?;
    }

    bail!("did not see initial execve() in tracee");
}
