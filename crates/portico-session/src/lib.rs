//! Session lifecycle core for the Portico display manager.
//!
//! This library turns an authenticated identity into a running,
//! privilege-correct user process and a registered system session, and later
//! tears both down. The [`Session`] orchestrates the start/rollback and
//! stop/teardown protocols on the service side; the [`ChildSequence`] is the
//! ordered work the forked child performs before exec'ing the target command.
//! Authentication, session registration and the child process itself are
//! collaborator traits so embedders can supply their own transports.

pub mod auth;
pub mod child;
pub mod command;
pub mod env;
pub mod error;
pub mod native;
pub mod process;
pub mod registrar;
pub mod session;
pub mod user;

pub use auth::{AuthenticationHandle, StaticAuthentication};
pub use child::{ChildOps, ChildSequence, SystemChildOps};
pub use command::{ResolvedCommand, resolve_command};
pub use env::Environment;
pub use error::{ChildError, StartError};
pub use native::{ProcessExit, SystemProcess};
pub use process::{ProcessHandle, SignalKind};
pub use registrar::{NullRegistrar, RegistrarValue, SessionRegistrar};
pub use session::{
    DefaultBehavior, PrivilegeContext, Session, SessionBehavior, SessionState,
};
pub use user::UserIdentity;
