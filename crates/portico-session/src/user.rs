//! User identity descriptors and passwd-database lookup.

use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result, bail};

/// Read-only description of the identity a session runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home_directory: PathBuf,
    pub shell: String,
    /// Preferred locale, exported to the child as LANG when present.
    pub locale: Option<String>,
}

impl UserIdentity {
    /// Resolves a user from the passwd database.
    pub fn from_passwd(username: &str) -> Result<Self> {
        let output = Command::new("getent")
            .args(["passwd", username])
            .output()
            .context("running getent passwd")?;

        if !output.status.success() {
            bail!("user {} not found in passwd database", username);
        }

        let line = String::from_utf8_lossy(&output.stdout);
        parse_passwd_entry(line.trim_end())
    }

    pub fn with_locale(mut self, locale: &str) -> Self {
        self.locale = Some(locale.to_string());
        self
    }
}

/// Parses one `name:x:uid:gid:gecos:home:shell` passwd line.
fn parse_passwd_entry(line: &str) -> Result<UserIdentity> {
    let fields: Vec<&str> = line.split(':').collect();
    if fields.len() < 7 {
        bail!("malformed passwd entry: {}", line);
    }

    let uid = fields[2]
        .parse::<u32>()
        .with_context(|| format!("parsing uid for {}", fields[0]))?;
    let gid = fields[3]
        .parse::<u32>()
        .with_context(|| format!("parsing gid for {}", fields[0]))?;

    Ok(UserIdentity {
        name: fields[0].to_string(),
        uid,
        gid,
        home_directory: PathBuf::from(fields[5]),
        shell: fields[6].to_string(),
        locale: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_passwd_entry() {
        let identity =
            parse_passwd_entry("alice:x:1000:1000:Alice Example:/home/alice:/bin/bash").unwrap();
        assert_eq!(identity.name, "alice");
        assert_eq!(identity.uid, 1000);
        assert_eq!(identity.gid, 1000);
        assert_eq!(identity.home_directory, PathBuf::from("/home/alice"));
        assert_eq!(identity.shell, "/bin/bash");
        assert_eq!(identity.locale, None);
    }

    #[test]
    fn test_parse_passwd_entry_rejects_short_lines() {
        assert!(parse_passwd_entry("alice:x:1000").is_err());
    }

    #[test]
    fn test_parse_passwd_entry_rejects_bad_uid() {
        assert!(parse_passwd_entry("alice:x:not-a-uid:1000::/home/alice:/bin/bash").is_err());
    }

    #[test]
    fn test_with_locale() {
        let identity =
            parse_passwd_entry("alice:x:1000:1000::/home/alice:/bin/bash").unwrap();
        let identity = identity.with_locale("de_DE.UTF-8");
        assert_eq!(identity.locale.as_deref(), Some("de_DE.UTF-8"));
    }
}
