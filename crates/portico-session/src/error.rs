//! Session lifecycle error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can abort a session start.
///
/// Registration failure is deliberately not represented here: the session
/// registrar is best-effort, so a failed registration is logged and the
/// session proceeds unregistered.
#[derive(Debug, Error)]
pub enum StartError {
    /// A required piece of configuration is missing or the session was
    /// already started.
    #[error("cannot start session: {0}")]
    MissingPrecondition(&'static str),

    /// The configured program was not found on the caller's search path.
    #[error("command not found: {0}")]
    CommandNotFound(String),

    /// The authentication handle could not open its credential session.
    #[error("failed to open authentication session: {0:#}")]
    AuthenticationOpenFailed(anyhow::Error),

    /// The behavior's setup hook reported failure.
    #[error("session setup failed: {0:#}")]
    SetupFailed(anyhow::Error),

    /// The child process could not be launched.
    #[error("failed to launch session process: {0}")]
    LaunchFailed(#[source] std::io::Error),
}

/// Fatal errors inside the child execution context, before exec.
///
/// Any of these terminates the child without running the target command.
/// Recoverable child-side conditions (log file, stdin, setsid, malformed
/// environment entries) are logged instead and never constructed here.
#[derive(Debug, Error)]
pub enum ChildError {
    /// Could not change into the user's home directory.
    #[error("failed to change to home directory {path}: {source}")]
    ChangeDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Could not initialize supplementary groups.
    #[error("failed to initialize supplementary groups for {user}: {source}")]
    InitGroups {
        user: String,
        #[source]
        source: std::io::Error,
    },

    /// Could not set the group id.
    #[error("failed to set group id to {gid}: {source}")]
    SetGid {
        gid: u32,
        #[source]
        source: std::io::Error,
    },

    /// Could not set the user id.
    #[error("failed to set user id to {uid}: {source}")]
    SetUid {
        uid: u32,
        #[source]
        source: std::io::Error,
    },

    /// The exec of the target command failed.
    #[error("failed to execute {command}: {source}")]
    Exec {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_error_display() {
        let err = StartError::MissingPrecondition("no authentication set");
        assert_eq!(
            err.to_string(),
            "cannot start session: no authentication set"
        );

        let err = StartError::CommandNotFound("nonexistent-shell".to_string());
        assert_eq!(err.to_string(), "command not found: nonexistent-shell");
    }

    #[test]
    fn test_child_error_display() {
        let err = ChildError::SetGid {
            gid: 1000,
            source: std::io::Error::from_raw_os_error(libc::EPERM),
        };
        assert!(err.to_string().starts_with("failed to set group id to 1000"));
    }
}
