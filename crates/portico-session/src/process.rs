//! Child-process collaborator contract.

use std::io;

use crate::child::ChildSequence;
use crate::command::ResolvedCommand;

/// Signals the session core can ask a process handle to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// Polite termination request (SIGTERM).
    Terminate,
    /// Forced kill (SIGKILL). The session core never sends this; embedders
    /// may use it for shutdown escalation.
    Kill,
}

/// A single child process being prepared and supervised.
///
/// The session core stages the command, the environment, the
/// clear-environment flag, and the child-side sequence, then starts the
/// process once. Exit is observed by the embedder, which delivers
/// `Session::notify_stopped` when it happens.
pub trait ProcessHandle: Send {
    fn set_command(&mut self, command: ResolvedCommand);

    fn set_env(&mut self, name: &str, value: &str);

    /// When true (the session default), the child starts from exactly the
    /// staged variables instead of inheriting the service's environment.
    fn set_clear_environment(&mut self, clear: bool);

    /// Installs the sequence the child runs between fork and exec.
    fn set_child_sequence(&mut self, sequence: ChildSequence);

    fn start(&mut self) -> io::Result<()>;

    fn signal(&mut self, signal: SignalKind);

    fn is_running(&mut self) -> bool;
}
