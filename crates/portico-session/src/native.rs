//! Host process implementation: fork, run the child sequence, exec.
//!
//! The parent side records the pid, delivers signals and runs a blocking
//! reaper task that publishes the exit through a watch channel. The embedder
//! awaits [`SystemProcess::subscribe_exit`] and delivers
//! `Session::notify_stopped` when the exit appears.

use std::io;

use fork::Fork;
use log::{debug, info, warn};
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::Pid;
use tokio::sync::watch;

use crate::child::{ChildSequence, SystemChildOps};
use crate::command::ResolvedCommand;
use crate::env::Environment;
use crate::process::{ProcessHandle, SignalKind};

/// How a session process ended.
///
/// `code` is set for a normal exit, `signal` when the process was killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ProcessExit {
    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exited with code {code}"),
            (None, Some(signal)) => format!("killed by signal {signal}"),
            (None, None) => "exited with unknown status".to_string(),
        }
    }

    /// Shell-convention status for the launcher's own exit: the code as-is,
    /// or 128 plus the signal number.
    pub fn status_code(&self) -> i32 {
        match (self.code, self.signal) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal,
            (None, None) => 1,
        }
    }
}

/// A session child launched with fork(2).
///
/// The child branch builds the final environment, runs the staged
/// [`ChildSequence`] and execs; any fatal child error terminates it without
/// running the target command. One `SystemProcess` launches one child; the
/// session stages command, environment and sequence before each start.
pub struct SystemProcess {
    command: Option<ResolvedCommand>,
    staged: Environment,
    clear_environment: bool,
    sequence: Option<ChildSequence>,
    pid: Option<Pid>,
    exit_tx: watch::Sender<Option<ProcessExit>>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
}

impl SystemProcess {
    pub fn new() -> Self {
        let (exit_tx, exit_rx) = watch::channel(None);
        Self {
            command: None,
            staged: Environment::new(),
            clear_environment: true,
            sequence: None,
            pid: None,
            exit_tx,
            exit_rx,
        }
    }

    /// The channel the reaper announces the exit on. Holds `None` until the
    /// child has been reaped.
    pub fn subscribe_exit(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit_rx.clone()
    }

    pub fn pid(&self) -> Option<i32> {
        self.pid.map(Pid::as_raw)
    }

    fn reap(pid: Pid, exit_tx: watch::Sender<Option<ProcessExit>>) {
        let exit = match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => ProcessExit {
                code: Some(code),
                signal: None,
            },
            Ok(WaitStatus::Signaled(_, signal, _)) => ProcessExit {
                code: None,
                signal: Some(signal as i32),
            },
            Ok(status) => {
                warn!("unexpected wait status for session process {pid}: {status:?}");
                ProcessExit {
                    code: None,
                    signal: None,
                }
            }
            Err(err) => {
                warn!("failed to wait for session process {pid}: {err}");
                ProcessExit {
                    code: None,
                    signal: None,
                }
            }
        };
        info!("session process {pid} {}", exit.describe());
        let _ = exit_tx.send(Some(exit));
    }
}

impl Default for SystemProcess {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessHandle for SystemProcess {
    fn set_command(&mut self, command: ResolvedCommand) {
        self.command = Some(command);
    }

    fn set_env(&mut self, name: &str, value: &str) {
        self.staged.set(name, value);
    }

    fn set_clear_environment(&mut self, clear: bool) {
        self.clear_environment = clear;
    }

    fn set_child_sequence(&mut self, sequence: ChildSequence) {
        self.sequence = Some(sequence);
    }

    fn start(&mut self) -> io::Result<()> {
        let Some(command) = self.command.clone() else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "no command staged"));
        };
        let Some(sequence) = self.sequence.take() else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no child sequence staged",
            ));
        };

        // The child reconstructs its state purely from these values; nothing
        // else crosses the fork point.
        let mut environment = if self.clear_environment {
            Environment::new()
        } else {
            Environment::from_process()
        };
        for (name, value) in self.staged.iter() {
            environment.set(name, value);
        }

        match fork::fork() {
            Ok(Fork::Child) => {
                let mut ops = SystemChildOps;
                // The logger's state is unreliable after fork; report straight
                // to stderr, which points at the session log once redirected.
                if let Err(err) = sequence.run(&command, &mut environment, &mut ops) {
                    eprintln!("session child aborted: {err}");
                    unsafe { libc::_exit(1) };
                }
                // exec only returns through the error branch above.
                unsafe { libc::_exit(0) };
            }
            Ok(Fork::Parent(pid)) => {
                let pid = Pid::from_raw(pid);
                debug!("session process forked with pid {pid}");
                self.pid = Some(pid);
                let exit_tx = self.exit_tx.clone();
                tokio::task::spawn_blocking(move || Self::reap(pid, exit_tx));
                Ok(())
            }
            Err(errno) => Err(io::Error::from_raw_os_error(errno)),
        }
    }

    fn signal(&mut self, signal: SignalKind) {
        let Some(pid) = self.pid else {
            warn!("ignoring {signal:?} for a process that was never started");
            return;
        };
        let signal = match signal {
            SignalKind::Terminate => Signal::SIGTERM,
            SignalKind::Kill => Signal::SIGKILL,
        };
        if let Err(err) = kill(pid, signal) {
            warn!("failed to deliver {signal} to session process {pid}: {err}");
        }
    }

    fn is_running(&mut self) -> bool {
        self.pid.is_some() && self.exit_rx.borrow().is_none()
    }
}
