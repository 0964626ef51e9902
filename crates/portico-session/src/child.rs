//! The sequence a session child runs between fork and exec.
//!
//! Everything the child needs travels in the `ChildSequence` value plus the
//! environment map and resolved command; after the fork point nothing else is
//! shared with the service. Syscalls go through the `ChildOps` seam so the
//! ordering rules can be exercised without forking or holding real privilege.

use std::ffi::CString;
use std::fs;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};
use nix::unistd::{Gid, Uid};

use crate::auth::AuthenticationHandle;
use crate::command::ResolvedCommand;
use crate::env::Environment;
use crate::error::ChildError;
use crate::session::PrivilegeContext;
use crate::user::UserIdentity;

/// The operations the child sequence performs, in syscall form.
pub trait ChildOps {
    fn redirect_stdin_to_null(&mut self) -> io::Result<()>;

    /// Opens `path` write/create/truncate with mode 0600 and points stdout
    /// and stderr at it.
    fn redirect_output(&mut self, path: &Path) -> io::Result<()>;

    /// setsid: detach from the controlling terminal.
    fn new_session(&mut self) -> io::Result<()>;

    fn change_directory(&mut self, path: &Path) -> io::Result<()>;

    fn init_groups(&mut self, user: &str, gid: u32) -> io::Result<()>;

    fn set_group_id(&mut self, gid: u32) -> io::Result<()>;

    fn set_user_id(&mut self, uid: u32) -> io::Result<()>;

    /// Replaces the process image. Returns only on failure; the Ok value
    /// exists for test doubles.
    fn exec(&mut self, command: &ResolvedCommand, environment: &Environment) -> io::Result<()>;
}

/// Host implementation of [`ChildOps`].
pub struct SystemChildOps;

impl ChildOps for SystemChildOps {
    fn redirect_stdin_to_null(&mut self) -> io::Result<()> {
        let null = fs::File::open("/dev/null")?;
        if unsafe { libc::dup2(null.as_raw_fd(), libc::STDIN_FILENO) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn redirect_output(&mut self, path: &Path) -> io::Result<()> {
        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        for target in [libc::STDOUT_FILENO, libc::STDERR_FILENO] {
            if unsafe { libc::dup2(file.as_raw_fd(), target) } < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    fn new_session(&mut self) -> io::Result<()> {
        nix::unistd::setsid()?;
        Ok(())
    }

    fn change_directory(&mut self, path: &Path) -> io::Result<()> {
        nix::unistd::chdir(path)?;
        Ok(())
    }

    fn init_groups(&mut self, user: &str, gid: u32) -> io::Result<()> {
        let user = CString::new(user)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "user name contains NUL"))?;
        nix::unistd::initgroups(&user, Gid::from_raw(gid))?;
        Ok(())
    }

    fn set_group_id(&mut self, gid: u32) -> io::Result<()> {
        nix::unistd::setgid(Gid::from_raw(gid))?;
        Ok(())
    }

    fn set_user_id(&mut self, uid: u32) -> io::Result<()> {
        nix::unistd::setuid(Uid::from_raw(uid))?;
        Ok(())
    }

    fn exec(&mut self, command: &ResolvedCommand, environment: &Environment) -> io::Result<()> {
        let program = CString::new(command.program.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "program path contains NUL"))?;
        let argv = command
            .argv()
            .into_iter()
            .map(CString::new)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "argument contains NUL"))?;
        let envp = environment.to_exec_form();

        match nix::unistd::execve(&program, &argv, &envp) {
            Ok(never) => match never {},
            Err(err) => Err(err.into()),
        }
    }
}

/// The ordered child-side work: output plumbing, session detach, home
/// directory, privilege drop, post-drop authentication setup, environment
/// finalization, exec.
pub struct ChildSequence {
    identity: UserIdentity,
    privilege: PrivilegeContext,
    authentication: Arc<dyn AuthenticationHandle>,
    log_file: Option<PathBuf>,
    log_file_owned_by_user: bool,
    utility_directory: Option<PathBuf>,
}

impl ChildSequence {
    pub fn new(
        identity: UserIdentity,
        privilege: PrivilegeContext,
        authentication: Arc<dyn AuthenticationHandle>,
        log_file: Option<PathBuf>,
        log_file_owned_by_user: bool,
        utility_directory: Option<PathBuf>,
    ) -> Self {
        Self {
            identity,
            privilege,
            authentication,
            log_file,
            log_file_owned_by_user,
            utility_directory,
        }
    }

    /// Runs the sequence and execs `command`. The order is load-bearing:
    /// supplementary groups before gid before uid, working directory before
    /// the drop, user-owned log files after it, PATH prefixing after the
    /// authentication overrides (which may set PATH themselves).
    ///
    /// Returns an error for the fatal conditions; the caller terminates the
    /// child without running the target command. Soft failures (stdin, log
    /// file, setsid, post-drop setup, malformed override entries) are logged
    /// here and do not stop the sequence.
    pub fn run(
        &self,
        command: &ResolvedCommand,
        environment: &mut Environment,
        ops: &mut dyn ChildOps,
    ) -> Result<(), ChildError> {
        if let Err(err) = ops.redirect_stdin_to_null() {
            warn!("failed to redirect stdin to /dev/null: {err}");
        }

        if !self.log_file_owned_by_user {
            self.redirect_log(ops);
        }

        if let Err(err) = ops.new_session() {
            warn!("failed to make process a new session: {err}");
        }

        let home = &self.identity.home_directory;
        ops.change_directory(home)
            .map_err(|source| ChildError::ChangeDirectory {
                path: home.clone(),
                source,
            })?;

        if self.privilege == PrivilegeContext::Elevated {
            ops.init_groups(&self.identity.name, self.identity.gid)
                .map_err(|source| ChildError::InitGroups {
                    user: self.identity.name.clone(),
                    source,
                })?;
            ops.set_group_id(self.identity.gid)
                .map_err(|source| ChildError::SetGid {
                    gid: self.identity.gid,
                    source,
                })?;
            ops.set_user_id(self.identity.uid)
                .map_err(|source| ChildError::SetUid {
                    uid: self.identity.uid,
                    source,
                })?;
        }

        if self.log_file_owned_by_user {
            self.redirect_log(ops);
        }

        if let Err(err) = self.authentication.setup() {
            warn!("post-drop authentication setup failed: {err:#}");
        }

        let overrides = self.authentication.environment_overrides();
        if !overrides.is_empty() {
            debug!("authentication returned environment '{}'", overrides.join(" "));
        }
        environment.merge_assignments(&overrides);

        if let Some(locale) = &self.identity.locale {
            debug!("using locale {locale}");
            environment.set("LANG", locale);
        }

        if let Some(directory) = &self.utility_directory {
            environment.prepend_path(directory);
        }

        ops.exec(command, environment)
            .map_err(|source| ChildError::Exec {
                command: command.to_string(),
                source,
            })
    }

    fn redirect_log(&self, ops: &mut dyn ChildOps) {
        let Some(path) = &self.log_file else {
            return;
        };
        if let Err(err) = ops.redirect_output(path) {
            warn!("failed to open log file {}: {err}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingAuth {
        identity: UserIdentity,
        overrides: Vec<String>,
        setup_calls: AtomicUsize,
    }

    impl CountingAuth {
        fn new(identity: UserIdentity, overrides: Vec<String>) -> Self {
            Self {
                identity,
                overrides,
                setup_calls: AtomicUsize::new(0),
            }
        }
    }

    impl AuthenticationHandle for CountingAuth {
        fn user(&self) -> &UserIdentity {
            &self.identity
        }

        fn open(&self) -> anyhow::Result<()> {
            Ok(())
        }

        fn setup(&self) -> anyhow::Result<()> {
            self.setup_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn close(&self) {}

        fn environment_overrides(&self) -> Vec<String> {
            self.overrides.clone()
        }
    }

    #[derive(Default)]
    struct RecordingOps {
        calls: Vec<String>,
        fail_on: Option<&'static str>,
        exec_environment: Option<Environment>,
    }

    impl RecordingOps {
        fn failing_at(step: &'static str) -> Self {
            Self {
                fail_on: Some(step),
                ..Self::default()
            }
        }

        fn record(&mut self, step: &str) -> io::Result<()> {
            self.calls.push(step.to_string());
            if self.fail_on == Some(step) {
                return Err(io::Error::from_raw_os_error(libc::EPERM));
            }
            Ok(())
        }

        fn reached_exec(&self) -> bool {
            self.calls.iter().any(|call| call == "exec")
        }
    }

    impl ChildOps for RecordingOps {
        fn redirect_stdin_to_null(&mut self) -> io::Result<()> {
            self.record("stdin")
        }

        fn redirect_output(&mut self, _path: &Path) -> io::Result<()> {
            self.record("redirect_output")
        }

        fn new_session(&mut self) -> io::Result<()> {
            self.record("setsid")
        }

        fn change_directory(&mut self, _path: &Path) -> io::Result<()> {
            self.record("chdir")
        }

        fn init_groups(&mut self, _user: &str, _gid: u32) -> io::Result<()> {
            self.record("initgroups")
        }

        fn set_group_id(&mut self, _gid: u32) -> io::Result<()> {
            self.record("setgid")
        }

        fn set_user_id(&mut self, _uid: u32) -> io::Result<()> {
            self.record("setuid")
        }

        fn exec(&mut self, _command: &ResolvedCommand, environment: &Environment) -> io::Result<()> {
            self.record("exec")?;
            self.exec_environment = Some(environment.clone());
            Ok(())
        }
    }

    fn identity() -> UserIdentity {
        UserIdentity {
            name: "alice".to_string(),
            uid: 1000,
            gid: 1000,
            home_directory: PathBuf::from("/home/alice"),
            shell: "/bin/bash".to_string(),
            locale: Some("de_DE.UTF-8".to_string()),
        }
    }

    fn command() -> ResolvedCommand {
        ResolvedCommand {
            program: PathBuf::from("/usr/bin/session-shell"),
            arguments: String::new(),
        }
    }

    fn sequence(
        privilege: PrivilegeContext,
        auth: Arc<dyn AuthenticationHandle>,
        log_file: Option<PathBuf>,
        log_owned_by_user: bool,
    ) -> ChildSequence {
        ChildSequence::new(
            identity(),
            privilege,
            auth,
            log_file,
            log_owned_by_user,
            Some(PathBuf::from("/usr/lib/portico")),
        )
    }

    fn baseline_environment() -> Environment {
        let mut env = Environment::new();
        env.set("PATH", "/usr/local/bin:/usr/bin:/bin");
        env.set("HOME", "/home/alice");
        env.set("USER", "alice");
        env
    }

    #[test]
    fn test_elevated_sequence_order() {
        let auth = Arc::new(CountingAuth::new(identity(), Vec::new()));
        let seq = sequence(PrivilegeContext::Elevated, auth.clone(), None, false);
        let mut ops = RecordingOps::default();
        let mut env = baseline_environment();

        seq.run(&command(), &mut env, &mut ops).unwrap();

        assert_eq!(
            ops.calls,
            vec!["stdin", "setsid", "chdir", "initgroups", "setgid", "setuid", "exec"]
        );
        assert_eq!(auth.setup_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unprivileged_sequence_skips_identity_change() {
        let auth = Arc::new(CountingAuth::new(identity(), Vec::new()));
        let seq = sequence(PrivilegeContext::Unprivileged, auth, None, false);
        let mut ops = RecordingOps::default();
        let mut env = baseline_environment();

        seq.run(&command(), &mut env, &mut ops).unwrap();

        assert_eq!(ops.calls, vec!["stdin", "setsid", "chdir", "exec"]);
    }

    #[test]
    fn test_identity_change_failures_prevent_exec() {
        for step in ["initgroups", "setgid", "setuid"] {
            let auth = Arc::new(CountingAuth::new(identity(), Vec::new()));
            let seq = sequence(PrivilegeContext::Elevated, auth, None, false);
            let mut ops = RecordingOps::failing_at(step);
            let mut env = baseline_environment();

            let err = seq.run(&command(), &mut env, &mut ops).unwrap_err();
            let kind_matches = match step {
                "initgroups" => matches!(err, ChildError::InitGroups { .. }),
                "setgid" => matches!(err, ChildError::SetGid { gid: 1000, .. }),
                _ => matches!(err, ChildError::SetUid { uid: 1000, .. }),
            };
            assert!(kind_matches, "unexpected error for {step}: {err}");
            assert!(!ops.reached_exec(), "{step} failure must prevent exec");
        }
    }

    #[test]
    fn test_group_failure_stops_before_uid_change() {
        let auth = Arc::new(CountingAuth::new(identity(), Vec::new()));
        let seq = sequence(PrivilegeContext::Elevated, auth, None, false);
        let mut ops = RecordingOps::failing_at("setgid");
        let mut env = baseline_environment();

        seq.run(&command(), &mut env, &mut ops).unwrap_err();
        assert!(!ops.calls.iter().any(|call| call == "setuid"));
    }

    #[test]
    fn test_chdir_failure_is_fatal() {
        let auth = Arc::new(CountingAuth::new(identity(), Vec::new()));
        let seq = sequence(PrivilegeContext::Elevated, auth, None, false);
        let mut ops = RecordingOps::failing_at("chdir");
        let mut env = baseline_environment();

        let err = seq.run(&command(), &mut env, &mut ops).unwrap_err();
        assert!(matches!(err, ChildError::ChangeDirectory { .. }));
        assert!(!ops.reached_exec());
    }

    #[test]
    fn test_service_owned_log_opens_before_privilege_drop() {
        let auth = Arc::new(CountingAuth::new(identity(), Vec::new()));
        let seq = sequence(
            PrivilegeContext::Elevated,
            auth,
            Some(PathBuf::from("/var/log/portico/session.log")),
            false,
        );
        let mut ops = RecordingOps::default();
        let mut env = baseline_environment();

        seq.run(&command(), &mut env, &mut ops).unwrap();

        let log_at = ops.calls.iter().position(|c| c == "redirect_output").unwrap();
        let drop_at = ops.calls.iter().position(|c| c == "initgroups").unwrap();
        assert!(log_at < drop_at);
    }

    #[test]
    fn test_user_owned_log_opens_after_privilege_drop() {
        let auth = Arc::new(CountingAuth::new(identity(), Vec::new()));
        let seq = sequence(
            PrivilegeContext::Elevated,
            auth,
            Some(PathBuf::from("/home/alice/.xsession-errors")),
            true,
        );
        let mut ops = RecordingOps::default();
        let mut env = baseline_environment();

        seq.run(&command(), &mut env, &mut ops).unwrap();

        let log_at = ops.calls.iter().position(|c| c == "redirect_output").unwrap();
        let drop_at = ops.calls.iter().position(|c| c == "setuid").unwrap();
        assert!(drop_at < log_at);
    }

    #[test]
    fn test_log_file_failure_is_soft() {
        let auth = Arc::new(CountingAuth::new(identity(), Vec::new()));
        let seq = sequence(
            PrivilegeContext::Elevated,
            auth,
            Some(PathBuf::from("/var/log/portico/session.log")),
            false,
        );
        let mut ops = RecordingOps::failing_at("redirect_output");
        let mut env = baseline_environment();

        seq.run(&command(), &mut env, &mut ops).unwrap();
        assert!(ops.reached_exec());
    }

    #[test]
    fn test_environment_layering() {
        let auth = Arc::new(CountingAuth::new(
            identity(),
            vec![
                "HOME=/srv/override-home".to_string(),
                "PATH=/opt/pam/bin".to_string(),
                "BROKEN-ENTRY".to_string(),
            ],
        ));
        let seq = sequence(PrivilegeContext::Unprivileged, auth, None, false);
        let mut ops = RecordingOps::default();
        let mut env = baseline_environment();

        seq.run(&command(), &mut env, &mut ops).unwrap();
        let final_env = ops.exec_environment.unwrap();

        // Override beats baseline; locale beats overrides; the utility path
        // is prepended to the override-provided PATH.
        assert_eq!(final_env.get("HOME"), Some("/srv/override-home"));
        assert_eq!(final_env.get("LANG"), Some("de_DE.UTF-8"));
        assert_eq!(final_env.get("PATH"), Some("/usr/lib/portico:/opt/pam/bin"));
        assert_eq!(final_env.get("USER"), Some("alice"));
        assert_eq!(final_env.get("BROKEN-ENTRY"), None);
    }
}
