//! Authentication collaborator contract.

use anyhow::Result;
use log::debug;

use crate::user::UserIdentity;

/// An opened credential session (PAM or equivalent) for one user.
///
/// `open` and `close` bracket the credential session on the service side.
/// `setup` has two permitted call sites: one on the service side before the
/// child exists (unused by the default session behavior) and one inside the
/// child after the privilege drop. Each call may only affect the calling
/// process and its environment, never shared state.
pub trait AuthenticationHandle: Send + Sync {
    /// The identity this credential session authenticated.
    fn user(&self) -> &UserIdentity;

    /// Opens the credential session (account and session bookkeeping).
    fn open(&self) -> Result<()>;

    /// Identity-specific session setup; see the call-site contract above.
    fn setup(&self) -> Result<()>;

    /// Closes the credential session. Teardown proceeds regardless of the
    /// outcome, so adapters report their own failures.
    fn close(&self);

    /// `name=value` assignments the credential session wants the child to
    /// carry.
    fn environment_overrides(&self) -> Vec<String>;
}

/// Fixed-identity handle with a preset override list.
///
/// The open/setup/close phases are accepted and do nothing, which is what a
/// transportless deployment needs.
pub struct StaticAuthentication {
    identity: UserIdentity,
    overrides: Vec<String>,
}

impl StaticAuthentication {
    pub fn new(identity: UserIdentity) -> Self {
        Self {
            identity,
            overrides: Vec::new(),
        }
    }

    pub fn with_overrides(identity: UserIdentity, overrides: Vec<String>) -> Self {
        Self {
            identity,
            overrides,
        }
    }
}

impl AuthenticationHandle for StaticAuthentication {
    fn user(&self) -> &UserIdentity {
        &self.identity
    }

    fn open(&self) -> Result<()> {
        debug!("opening static credential session for {}", self.identity.name);
        Ok(())
    }

    fn setup(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) {
        debug!("closing static credential session for {}", self.identity.name);
    }

    fn environment_overrides(&self) -> Vec<String> {
        self.overrides.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn identity() -> UserIdentity {
        UserIdentity {
            name: "alice".to_string(),
            uid: 1000,
            gid: 1000,
            home_directory: PathBuf::from("/home/alice"),
            shell: "/bin/bash".to_string(),
            locale: None,
        }
    }

    #[test]
    fn test_static_authentication_passes_through() {
        let auth = StaticAuthentication::with_overrides(
            identity(),
            vec!["KRB5CCNAME=FILE:/tmp/krb5cc_1000".to_string()],
        );
        assert!(auth.open().is_ok());
        assert!(auth.setup().is_ok());
        assert_eq!(auth.user().name, "alice");
        assert_eq!(auth.environment_overrides().len(), 1);
    }
}
