//! Session environment construction.

use std::collections::HashMap;
use std::ffi::CString;
use std::path::Path;

use log::warn;

/// The environment handed to the session child.
///
/// Keys are unique; a repeated `set` overwrites. The child-visible result is
/// layered in a fixed order: baseline POSIX variables, authentication
/// overrides, LANG from the locale, then the utility-path prefix. Later
/// layers win on key collision.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    vars: HashMap<String, String>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Captures the calling process's environment. Used when a session is
    /// configured to let the child inherit rather than start clean.
    pub fn from_process() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    pub fn set(&mut self, name: &str, value: &str) {
        self.vars.insert(name.to_string(), value.to_string());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Merges `name=value` assignment strings into the environment.
    ///
    /// Entries with no `=` or with an empty name are malformed: they are
    /// logged and skipped, never fatal. Empty values are legal.
    pub fn merge_assignments(&mut self, assignments: &[String]) {
        for entry in assignments {
            match entry.split_once('=') {
                Some((name, value)) if !name.is_empty() => self.set(name, value),
                _ => warn!("cannot parse environment variable '{entry}'"),
            }
        }
    }

    /// Prepends `directory` to PATH. Does nothing when PATH is unset, so a
    /// deliberately path-less environment stays that way.
    pub fn prepend_path(&mut self, directory: &Path) {
        if let Some(original) = self.get("PATH") {
            let path = format!("{}:{}", directory.display(), original);
            self.set("PATH", &path);
        }
    }

    /// Renders `name=value` pairs for execve. Entries containing an interior
    /// NUL cannot be represented and are dropped with a warning.
    pub(crate) fn to_exec_form(&self) -> Vec<CString> {
        self.vars
            .iter()
            .filter_map(|(name, value)| match CString::new(format!("{name}={value}")) {
                Ok(entry) => Some(entry),
                Err(_) => {
                    warn!("dropping environment variable '{name}' containing NUL");
                    None
                }
            })
            .collect()
    }
}
