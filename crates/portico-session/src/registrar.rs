//! System-session registrar contract.

use std::collections::HashMap;

use anyhow::{Result, bail};
use log::debug;
use serde::{Deserialize, Serialize};

/// Environment variable carrying the session token: written for the child
/// after registration, read from the service's own environment when running
/// unprivileged inside an already-registered session.
pub const SESSION_COOKIE_ENV: &str = "XDG_SESSION_COOKIE";

/// Registration parameter carrying the numeric user id.
pub const UNIX_USER_PARAMETER: &str = "unix-user";

/// Registration parameter marking the session type, and the value used for
/// greeter sessions.
pub const SESSION_TYPE_PARAMETER: &str = "session-type";
pub const GREETER_SESSION_TYPE: &str = "LoginWindow";

/// A typed value in a registration request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegistrarValue {
    Boolean(bool),
    Integer(i64),
    String(String),
}

/// Tracks login sessions for the system.
///
/// `open` returns an opaque cookie identifying the registered session; the
/// same cookie is passed back for close/lock/unlock. Lock and unlock are
/// fire-and-forget, implementations log their own failures.
pub trait SessionRegistrar: Send + Sync {
    fn open(&self, parameters: &HashMap<String, RegistrarValue>) -> Result<String>;
    fn close(&self, cookie: &str) -> Result<()>;
    fn lock(&self, cookie: &str);
    fn unlock(&self, cookie: &str);
}

/// Registrar for deployments without a session tracker.
///
/// `open` fails, which the session core treats as "run unregistered".
pub struct NullRegistrar;

impl SessionRegistrar for NullRegistrar {
    fn open(&self, _parameters: &HashMap<String, RegistrarValue>) -> Result<String> {
        bail!("no session registrar transport configured")
    }

    fn close(&self, cookie: &str) -> Result<()> {
        debug!("ignoring close of session cookie {cookie}");
        Ok(())
    }

    fn lock(&self, cookie: &str) {
        debug!("ignoring lock of session cookie {cookie}");
    }

    fn unlock(&self, cookie: &str) {
        debug!("ignoring unlock of session cookie {cookie}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registrar_value_parses_untagged() {
        let value: RegistrarValue = serde_json::from_str("1000").unwrap();
        assert_eq!(value, RegistrarValue::Integer(1000));

        let value: RegistrarValue = serde_json::from_str("true").unwrap();
        assert_eq!(value, RegistrarValue::Boolean(true));

        let value: RegistrarValue = serde_json::from_str("\"LoginWindow\"").unwrap();
        assert_eq!(value, RegistrarValue::String("LoginWindow".to_string()));
    }

    #[test]
    fn test_null_registrar_refuses_registration() {
        let registrar = NullRegistrar;
        assert!(registrar.open(&HashMap::new()).is_err());
        assert!(registrar.close("cookie-1").is_ok());
    }
}
