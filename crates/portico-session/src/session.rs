//! Session lifecycle orchestration.
//!
//! A session turns an authenticated identity into a running user process and
//! a registered system session, then tears both down:
//!
//! ```text
//! NotStarted --start--> Starting --launch ok--> Running --stop--> Stopping
//!     ^                    |                                         |
//!     +---- rollback ------+                   notify_stopped        v
//!                                  Stopped <--------------------- (exit)
//! ```
//!
//! Start acquires in a fixed order (resolve command, open authentication,
//! register, launch) and every acquisition has a release reachable from every
//! later failure, shared with the stop teardown.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::auth::AuthenticationHandle;
use crate::child::ChildSequence;
use crate::command::resolve_command;
use crate::env::Environment;
use crate::error::StartError;
use crate::process::{ProcessHandle, SignalKind};
use crate::registrar::{
    GREETER_SESSION_TYPE, RegistrarValue, SESSION_COOKIE_ENV, SESSION_TYPE_PARAMETER,
    SessionRegistrar, UNIX_USER_PARAMETER,
};
use crate::user::UserIdentity;

/// Search path seeded for every session. Authentication overrides may replace
/// it; the utility directory is prepended afterwards in the child.
pub const DEFAULT_SESSION_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Default directory prepended to the child's PATH for session utilities.
pub const DEFAULT_UTILITY_DIRECTORY: &str = "/usr/lib/portico";

/// Whether the service holds administrative privilege.
///
/// Injected by the embedder instead of queried ambiently, which keeps both
/// branches of the registration and privilege-drop paths testable without
/// root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegeContext {
    Elevated,
    Unprivileged,
}

impl PrivilegeContext {
    /// Detects the context from the effective uid. Meant for binaries;
    /// library code receives the context as a value.
    pub fn detect() -> Self {
        if rustix::process::geteuid().is_root() {
            Self::Elevated
        } else {
            Self::Unprivileged
        }
    }

    pub fn is_elevated(self) -> bool {
        matches!(self, Self::Elevated)
    }
}

/// Lifecycle states of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Extension hooks around the start/stop protocol.
///
/// The default bodies implement the stock session: `start` runs the full
/// resolve/authenticate/register/launch sequence, `setup` and `cleanup` do
/// nothing. Variants override individual hooks and can delegate back to
/// [`Session::default_start`].
pub trait SessionBehavior: Send + Sync {
    fn start(&self, session: &mut Session) -> Result<(), StartError> {
        session.default_start()
    }

    /// Runs after registration, before launch. Failure aborts the start and
    /// rolls back everything acquired so far.
    fn setup(&self, _session: &mut Session) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs when a running session is stopped, before the termination signal
    /// is sent.
    fn cleanup(&self, _session: &mut Session) {}
}

/// The stock behavior: default hooks only.
pub struct DefaultBehavior;

impl SessionBehavior for DefaultBehavior {}

/// A single user session: configuration, lifecycle and teardown.
///
/// All transitions take `&mut self`, so exclusive ownership serializes
/// `start`, `stop` and `notify_stopped`; embedders sharing a session across
/// tasks wrap it in a mutex. A running session must be stopped before being
/// dropped; dropping one only releases memory, never the child process or
/// the registered session.
pub struct Session {
    state: SessionState,
    privilege: PrivilegeContext,
    behavior: Arc<dyn SessionBehavior>,
    process: Box<dyn ProcessHandle>,
    registrar: Arc<dyn SessionRegistrar>,
    authentication: Option<Arc<dyn AuthenticationHandle>>,
    command: Option<String>,
    log_file: Option<PathBuf>,
    log_file_owned_by_user: bool,
    is_greeter: bool,
    registrar_parameters: HashMap<String, RegistrarValue>,
    registrar_cookie: Option<String>,
    environment: Environment,
    utility_directory: Option<PathBuf>,
    clear_environment: bool,
}

impl Session {
    pub fn new(
        privilege: PrivilegeContext,
        behavior: Arc<dyn SessionBehavior>,
        process: Box<dyn ProcessHandle>,
        registrar: Arc<dyn SessionRegistrar>,
    ) -> Self {
        Self {
            state: SessionState::NotStarted,
            privilege,
            behavior,
            process,
            registrar,
            authentication: None,
            command: None,
            log_file: None,
            log_file_owned_by_user: false,
            is_greeter: false,
            registrar_parameters: HashMap::new(),
            registrar_cookie: None,
            environment: Environment::new(),
            utility_directory: Some(PathBuf::from(DEFAULT_UTILITY_DIRECTORY)),
            // Children never inherit the service's own environment unless an
            // embedder opts in.
            clear_environment: true,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn privilege(&self) -> PrivilegeContext {
        self.privilege
    }

    /// Must be set before `start`; the identity it carries drives the
    /// baseline environment and the privilege drop.
    pub fn set_authentication(&mut self, authentication: Arc<dyn AuthenticationHandle>) {
        self.authentication = Some(authentication);
    }

    pub fn authentication(&self) -> Option<&Arc<dyn AuthenticationHandle>> {
        self.authentication.as_ref()
    }

    pub fn user(&self) -> Option<&UserIdentity> {
        self.authentication.as_deref().map(|auth| auth.user())
    }

    pub fn set_command(&mut self, command: impl Into<String>) {
        self.command = Some(command.into());
    }

    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    pub fn set_log_file(&mut self, path: impl Into<PathBuf>, owned_by_user: bool) {
        self.log_file = Some(path.into());
        self.log_file_owned_by_user = owned_by_user;
    }

    pub fn log_file(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }

    pub fn set_is_greeter(&mut self, is_greeter: bool) {
        self.is_greeter = is_greeter;
    }

    pub fn is_greeter(&self) -> bool {
        self.is_greeter
    }

    /// Adds a parameter to the registration request. Keys are unique; the
    /// last write wins, including over the built-in parameters.
    pub fn set_registrar_parameter(&mut self, name: &str, value: RegistrarValue) {
        self.registrar_parameters.insert(name.to_string(), value);
    }

    pub fn registrar_cookie(&self) -> Option<&str> {
        self.registrar_cookie.as_deref()
    }

    pub fn set_env(&mut self, name: &str, value: &str) {
        self.environment.set(name, value);
    }

    pub fn env(&self, name: &str) -> Option<&str> {
        self.environment.get(name)
    }

    /// Overrides the utility directory prepended to the child's PATH; `None`
    /// disables the prefix entirely.
    pub fn set_utility_directory(&mut self, directory: Option<PathBuf>) {
        self.utility_directory = directory;
    }

    pub fn set_clear_environment(&mut self, clear: bool) {
        self.clear_environment = clear;
    }

    pub fn is_running(&mut self) -> bool {
        self.process.is_running()
    }

    /// Starts the session: seeds the baseline environment and runs the
    /// behavior's start hook. On failure everything acquired is released and
    /// the session returns to `NotStarted`.
    pub fn start(&mut self) -> Result<(), StartError> {
        if self.state != SessionState::NotStarted {
            return Err(StartError::MissingPrecondition("session was already started"));
        }
        let Some(authentication) = self.authentication.clone() else {
            return Err(StartError::MissingPrecondition("no authentication handle set"));
        };
        if self.command.is_none() {
            return Err(StartError::MissingPrecondition("no command set"));
        }

        info!("launching session for {}", authentication.user().name);
        self.state = SessionState::Starting;

        // Baseline POSIX variables. Authentication overrides, the locale and
        // the utility path land later, in the child, and win on collision.
        let user = authentication.user();
        self.environment.set("PATH", DEFAULT_SESSION_PATH);
        self.environment.set("USER", &user.name);
        self.environment.set("LOGNAME", &user.name);
        self.environment
            .set("HOME", &user.home_directory.display().to_string());
        self.environment.set("SHELL", &user.shell);

        let behavior = Arc::clone(&self.behavior);
        match behavior.start(self) {
            Ok(()) => {
                self.state = SessionState::Running;
                Ok(())
            }
            Err(err) => {
                self.state = SessionState::NotStarted;
                Err(err)
            }
        }
    }

    /// The stock start sequence; behaviors overriding `start` can delegate
    /// here. Order: resolve command, open authentication, register, expose
    /// the cookie, run the setup hook, launch.
    pub fn default_start(&mut self) -> Result<(), StartError> {
        let Some(authentication) = self.authentication.clone() else {
            return Err(StartError::MissingPrecondition("no authentication handle set"));
        };
        let Some(command_line) = self.command.clone() else {
            return Err(StartError::MissingPrecondition("no command set"));
        };

        // Resolved against the service's own PATH, before the restricted one
        // is in place, so the binary that runs is the one that was
        // authorized. Nothing is acquired before this point.
        let Some(command) = resolve_command(&command_line) else {
            debug!("cannot launch session, command not found: {command_line}");
            return Err(StartError::CommandNotFound(command_line));
        };

        authentication
            .open()
            .map_err(StartError::AuthenticationOpenFailed)?;

        self.registrar_cookie = match self.privilege {
            PrivilegeContext::Elevated => self.register_session(authentication.user()),
            // Already inside a session established by a privileged ancestor;
            // adopt its cookie.
            PrivilegeContext::Unprivileged => std::env::var(SESSION_COOKIE_ENV).ok(),
        };
        if let Some(cookie) = self.registrar_cookie.clone() {
            self.environment.set(SESSION_COOKIE_ENV, &cookie);
        }

        let behavior = Arc::clone(&self.behavior);
        if let Err(err) = behavior.setup(self) {
            self.release_session_resources();
            return Err(StartError::SetupFailed(err));
        }

        self.process.set_clear_environment(self.clear_environment);
        for (name, value) in self.environment.iter() {
            self.process.set_env(name, value);
        }
        self.process.set_command(command.clone());
        self.process.set_child_sequence(ChildSequence::new(
            authentication.user().clone(),
            self.privilege,
            Arc::clone(&authentication),
            self.log_file.clone(),
            self.log_file_owned_by_user,
            self.utility_directory.clone(),
        ));

        if let Err(err) = self.process.start() {
            warn!("failed to launch session process {command}: {err}");
            self.release_session_resources();
            return Err(StartError::LaunchFailed(err));
        }

        debug!("session process launched: {command}");
        Ok(())
    }

    /// Requests termination. Returns `true` when the session is already
    /// stopped; `false` when the signal was sent and the caller must await
    /// the termination notification.
    pub fn stop(&mut self) -> bool {
        match self.state {
            SessionState::NotStarted | SessionState::Stopped => {
                self.state = SessionState::Stopped;
                true
            }
            // Already signaled; cleanup and the signal must not repeat.
            SessionState::Stopping => false,
            SessionState::Starting | SessionState::Running => {
                if !self.process.is_running() {
                    // The child exited before the notification was
                    // delivered; complete the teardown now.
                    self.notify_stopped();
                    return true;
                }
                self.state = SessionState::Stopping;
                let behavior = Arc::clone(&self.behavior);
                behavior.cleanup(self);
                self.process.signal(SignalKind::Terminate);
                false
            }
        }
    }

    /// Delivers the process-termination notification. The embedder calls
    /// this when the child exits; the teardown (close authentication, close
    /// registration) runs exactly once no matter how often the notification
    /// fires.
    pub fn notify_stopped(&mut self) {
        match self.state {
            SessionState::NotStarted | SessionState::Stopped => {
                debug!("ignoring stop notification in state {:?}", self.state);
            }
            SessionState::Starting | SessionState::Running | SessionState::Stopping => {
                info!("session stopped");
                self.release_session_resources();
                self.state = SessionState::Stopped;
            }
        }
    }

    /// Locks the registered session. Only a privileged service can authorize
    /// this, and only for a session it registered.
    pub fn lock(&self) {
        if self.privilege.is_elevated() {
            if let Some(cookie) = &self.registrar_cookie {
                self.registrar.lock(cookie);
            }
        }
    }

    /// Unlocks the registered session; same conditions as [`Session::lock`].
    pub fn unlock(&self) {
        if self.privilege.is_elevated() {
            if let Some(cookie) = &self.registrar_cookie {
                self.registrar.unlock(cookie);
            }
        }
    }

    fn register_session(&self, user: &UserIdentity) -> Option<String> {
        let mut parameters = HashMap::new();
        parameters.insert(
            UNIX_USER_PARAMETER.to_string(),
            RegistrarValue::Integer(i64::from(user.uid)),
        );
        if self.is_greeter {
            parameters.insert(
                SESSION_TYPE_PARAMETER.to_string(),
                RegistrarValue::String(GREETER_SESSION_TYPE.to_string()),
            );
        }
        for (name, value) in &self.registrar_parameters {
            parameters.insert(name.clone(), value.clone());
        }

        match self.registrar.open(&parameters) {
            Ok(cookie) => Some(cookie),
            Err(err) => {
                warn!("failed to register session, continuing unregistered: {err:#}");
                None
            }
        }
    }

    /// Single release point for everything `start` acquires, reached from
    /// the launch-failure rollback, the setup-hook rollback and the stop
    /// teardown. Closing the registration requires elevated privilege; an
    /// adopted cookie is merely forgotten.
    fn release_session_resources(&mut self) {
        if let Some(authentication) = &self.authentication {
            authentication.close();
        }
        if let Some(cookie) = self.registrar_cookie.take() {
            if self.privilege.is_elevated() {
                if let Err(err) = self.registrar.close(&cookie) {
                    warn!("failed to close registered session {cookie}: {err:#}");
                }
            }
        }
    }
}
