//! Launcher configuration.
//!
//! Loaded from `~/.config/portico/config.toml` (or `--config`). A missing
//! file yields the defaults; an unreadable or unparsable file is reported and
//! also yields the defaults, so a broken config never prevents a login.
//!
//! ```toml
//! [launch]
//! utility_directory = "/usr/lib/portico"
//! locale = "en_US.UTF-8"
//! log_directory = "/var/log/portico"
//!
//! [session_params]
//! display-device = "/dev/tty7"
//! is-local = true
//! ```

use std::collections::HashMap;
use std::path::PathBuf;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use portico_session::RegistrarValue;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
struct ConfigFile {
    launch: LaunchSection,
    session_params: HashMap<String, toml::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
struct LaunchSection {
    utility_directory: Option<String>,
    locale: Option<String>,
    log_directory: Option<String>,
}

/// Effective launcher configuration, paths expanded.
#[derive(Debug, Clone, Default)]
pub struct LaunchConfig {
    /// Directory prepended to the session child's PATH.
    pub utility_directory: Option<PathBuf>,
    /// Locale exported to sessions as LANG.
    pub locale: Option<String>,
    /// Directory session log files default into.
    pub log_directory: Option<PathBuf>,
    /// Extra registration parameters merged into every session.
    pub session_params: Vec<(String, RegistrarValue)>,
}

impl LaunchConfig {
    /// Loads from the default location, `~/.config/portico/config.toml`.
    pub fn load() -> Self {
        Self::load_from_path(default_config_path())
    }

    pub fn load_from_path(path: PathBuf) -> Self {
        let config_file: ConfigFile = if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(contents) => match toml::from_str(&contents) {
                    Ok(config) => {
                        info!("loaded config from {:?}", path);
                        config
                    }
                    Err(e) => {
                        warn!("failed to parse config {:?}: {}, using defaults", path, e);
                        ConfigFile::default()
                    }
                },
                Err(e) => {
                    warn!("failed to read config {:?}: {}, using defaults", path, e);
                    ConfigFile::default()
                }
            }
        } else {
            debug!("config file {:?} not found, using defaults", path);
            ConfigFile::default()
        };

        let mut session_params = Vec::new();
        for (name, value) in config_file.session_params {
            match registrar_value(&value) {
                Some(value) => session_params.push((name, value)),
                None => warn!(
                    "ignoring session parameter '{}': unsupported value {}",
                    name, value
                ),
            }
        }

        Self {
            utility_directory: config_file.launch.utility_directory.map(expand_path),
            locale: config_file.launch.locale,
            log_directory: config_file.launch.log_directory.map(expand_path),
            session_params,
        }
    }
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/etc"))
        .join("portico")
        .join("config.toml")
}

fn expand_path(path: String) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path).into_owned())
}

/// Registration parameters carry strings, integers and booleans; tables,
/// arrays and floats have no registrar representation.
fn registrar_value(value: &toml::Value) -> Option<RegistrarValue> {
    match value {
        toml::Value::String(s) => Some(RegistrarValue::String(s.clone())),
        toml::Value::Integer(i) => Some(RegistrarValue::Integer(*i)),
        toml::Value::Boolean(b) => Some(RegistrarValue::Boolean(*b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = LaunchConfig::load_from_path(PathBuf::from("/nonexistent/config.toml"));
        assert_eq!(config.utility_directory, None);
        assert_eq!(config.locale, None);
        assert!(config.session_params.is_empty());
    }

    #[test]
    fn test_load_parses_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[launch]
utility_directory = "/usr/lib/portico"
locale = "de_DE.UTF-8"
log_directory = "/var/log/portico"

[session_params]
display-device = "/dev/tty7"
vt = 7
is-local = true
ignored = [1, 2]
"#,
        )
        .unwrap();

        let config = LaunchConfig::load_from_path(path);
        assert_eq!(
            config.utility_directory,
            Some(PathBuf::from("/usr/lib/portico"))
        );
        assert_eq!(config.locale.as_deref(), Some("de_DE.UTF-8"));
        assert_eq!(config.log_directory, Some(PathBuf::from("/var/log/portico")));

        let params: HashMap<_, _> = config.session_params.into_iter().collect();
        assert_eq!(
            params.get("display-device"),
            Some(&RegistrarValue::String("/dev/tty7".to_string()))
        );
        assert_eq!(params.get("vt"), Some(&RegistrarValue::Integer(7)));
        assert_eq!(params.get("is-local"), Some(&RegistrarValue::Boolean(true)));
        // The array value has no registrar representation.
        assert_eq!(params.get("ignored"), None);
    }

    #[test]
    fn test_load_malformed_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[launch\nbroken").unwrap();

        let config = LaunchConfig::load_from_path(path);
        assert_eq!(config.utility_directory, None);
    }
}
