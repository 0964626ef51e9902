//! portico-launch - runs a command as a privilege-correct user session.
//!
//! The launcher wires the session core to its host collaborators: a
//! passwd-database identity behind a static authentication handle, the
//! fork/exec process implementation, and the inert registrar (no session
//! tracker transport is configured on the command line). Run as root it
//! drops to the target user before the command executes; run unprivileged it
//! launches the command as the current user inside the inherited session.
//!
//! ```bash
//! # A login session for alice with a user-owned log
//! portico-launch --user alice --log-file ~alice/.xsession-errors \
//!     --user-owned-log -- openbox-session
//!
//! # A greeter session
//! portico-launch --greeter --session-param vt=7 -- portico-greeter
//! ```

mod config;

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;

use portico_session::{
    DefaultBehavior, NullRegistrar, PrivilegeContext, RegistrarValue, Session,
    StaticAuthentication, SystemProcess, UserIdentity,
};

use config::LaunchConfig;

#[derive(Parser, Debug)]
#[command(
    name = "portico-launch",
    about = "Launch a command as a managed user session"
)]
struct Args {
    /// Path to config file.
    /// Defaults to ~/.config/portico/config.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// User to run the session as.
    /// Defaults to the invoking user.
    #[arg(short, long, env = "PORTICO_USER")]
    user: Option<String>,

    /// File the session's stdout and stderr are redirected to.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Open the log file after the privilege drop so the session user owns it.
    #[arg(long)]
    user_owned_log: bool,

    /// Register the session as a greeter (login window).
    #[arg(long)]
    greeter: bool,

    /// Extra environment variable for the session, NAME=VALUE. Repeatable.
    #[arg(short = 'e', long = "env", value_name = "NAME=VALUE")]
    env: Vec<String>,

    /// Extra registration parameter, name=value (value parsed as JSON, bare
    /// text taken as a string). Repeatable.
    #[arg(long = "session-param", value_name = "NAME=VALUE")]
    session_params: Vec<String>,

    /// Locale exported to the session as LANG (overrides the config file).
    #[arg(long)]
    locale: Option<String>,

    /// Print the effective configuration and exit.
    #[arg(long)]
    show_config: bool,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// The session command: program followed by its arguments.
    #[arg(trailing_var_arg = true, required_unless_present = "show_config")]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let config = args
        .config
        .clone()
        .map(LaunchConfig::load_from_path)
        .unwrap_or_else(LaunchConfig::load);

    if args.show_config {
        println!("{config:#?}");
        return Ok(());
    }

    let username = match args.user.clone() {
        Some(user) => user,
        None => std::env::var("USER").context("no --user given and USER is not set")?,
    };
    let mut identity = UserIdentity::from_passwd(&username)
        .with_context(|| format!("resolving session user {username}"))?;
    if let Some(locale) = args.locale.clone().or_else(|| config.locale.clone()) {
        identity = identity.with_locale(&locale);
    }

    let privilege = PrivilegeContext::detect();
    info!(
        "starting session for {} ({:?})",
        identity.name, privilege
    );

    let process = SystemProcess::new();
    let mut exit_rx = process.subscribe_exit();

    let mut session = Session::new(
        privilege,
        Arc::new(DefaultBehavior),
        Box::new(process),
        Arc::new(NullRegistrar),
    );
    session.set_authentication(Arc::new(StaticAuthentication::new(identity.clone())));
    session.set_command(args.command.join(" "));
    session.set_is_greeter(args.greeter);

    if let Some(directory) = config.utility_directory.clone() {
        session.set_utility_directory(Some(directory));
    }

    let log_file = args.log_file.clone().or_else(|| {
        config
            .log_directory
            .as_ref()
            .map(|dir| dir.join(format!("{}.log", identity.name)))
    });
    if let Some(path) = log_file {
        session.set_log_file(path, args.user_owned_log);
    }

    for (name, value) in &config.session_params {
        session.set_registrar_parameter(name, value.clone());
    }
    for raw in &args.session_params {
        let (name, value) = parse_session_param(raw)?;
        session.set_registrar_parameter(&name, value);
    }
    for raw in &args.env {
        let (name, value) = parse_assignment(raw)?;
        session.set_env(&name, &value);
    }

    if let Err(err) = session.start() {
        bail!("failed to start session: {err}");
    }

    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("installing SIGTERM handler")?;

    // Second handle on the exit channel for the signal arms; `wait_for`
    // holds the first one for the duration of the select.
    let exit_view = exit_rx.clone();
    let exit = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, stopping session");
                if session.stop() {
                    break *exit_view.borrow();
                }
            }
            _ = sigterm.recv() => {
                info!("termination requested, stopping session");
                if session.stop() {
                    break *exit_view.borrow();
                }
            }
            result = exit_rx.wait_for(Option::is_some) => {
                break *result.context("session process reaper went away")?;
            }
        }
    };

    session.notify_stopped();

    match exit {
        Some(exit) => {
            info!("session {}", exit.describe());
            std::process::exit(exit.status_code());
        }
        None => Ok(()),
    }
}

fn parse_assignment(raw: &str) -> Result<(String, String)> {
    match raw.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => bail!("invalid environment variable '{raw}', expected NAME=VALUE"),
    }
}

/// `name=value` with the value parsed as JSON so integers and booleans keep
/// their type; anything that is not valid JSON is taken as a plain string.
fn parse_session_param(raw: &str) -> Result<(String, RegistrarValue)> {
    let (name, value) = parse_assignment(raw)
        .with_context(|| format!("invalid session parameter '{raw}'"))?;
    let value = serde_json::from_str::<RegistrarValue>(&value)
        .unwrap_or(RegistrarValue::String(value));
    Ok((name, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assignment() {
        assert_eq!(
            parse_assignment("DISPLAY=:0").unwrap(),
            ("DISPLAY".to_string(), ":0".to_string())
        );
        assert_eq!(
            parse_assignment("EMPTY=").unwrap(),
            ("EMPTY".to_string(), String::new())
        );
        assert!(parse_assignment("NOVALUE").is_err());
        assert!(parse_assignment("=value").is_err());
    }

    #[test]
    fn test_parse_session_param_types() {
        let (name, value) = parse_session_param("vt=7").unwrap();
        assert_eq!(name, "vt");
        assert_eq!(value, RegistrarValue::Integer(7));

        let (_, value) = parse_session_param("is-local=true").unwrap();
        assert_eq!(value, RegistrarValue::Boolean(true));

        let (_, value) = parse_session_param("display-device=/dev/tty7").unwrap();
        assert_eq!(
            value,
            RegistrarValue::String("/dev/tty7".to_string())
        );
    }

    #[test]
    fn test_args_require_command() {
        assert!(Args::try_parse_from(["portico-launch"]).is_err());
        let args =
            Args::try_parse_from(["portico-launch", "--greeter", "--", "greeter", "--debug"])
                .unwrap();
        assert!(args.greeter);
        assert_eq!(args.command, vec!["greeter", "--debug"]);

        let args = Args::try_parse_from(["portico-launch", "--show-config"]).unwrap();
        assert!(args.command.is_empty());
    }
}
