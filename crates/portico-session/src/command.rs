//! Resolution of the configured session command.

use std::env;
use std::fmt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// A session command after resolution: the absolute program path plus the
/// argument text that followed the program token, preserved verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    pub program: PathBuf,
    pub arguments: String,
}

impl ResolvedCommand {
    /// argv for exec: the program followed by whitespace-separated argument
    /// tokens. Shell quoting is not interpreted at this layer.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = vec![self.program.to_string_lossy().into_owned()];
        argv.extend(self.arguments.split_whitespace().map(str::to_string));
        argv
    }
}

impl fmt::Display for ResolvedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.arguments.is_empty() {
            write!(f, "{}", self.program.display())
        } else {
            write!(f, "{} {}", self.program.display(), self.arguments)
        }
    }
}

/// Resolves the command's program token against the caller's own PATH.
///
/// The first whitespace-separated token is the program; the remainder is kept
/// as-is. Resolution deliberately uses the calling service's PATH rather than
/// the restricted one the child will see, so the binary that ends up being
/// exec'd is the one that was authorized.
pub fn resolve_command(command: &str) -> Option<ResolvedCommand> {
    let search_path = env::var("PATH").unwrap_or_default();
    resolve_command_in(command, &search_path)
}

/// Resolution against an explicit search path.
pub fn resolve_command_in(command: &str, search_path: &str) -> Option<ResolvedCommand> {
    let trimmed = command.trim();
    let (program, arguments) = match trimmed.split_once(char::is_whitespace) {
        Some((program, rest)) => (program, rest.trim_start()),
        None => (trimmed, ""),
    };

    if program.is_empty() {
        return None;
    }

    let program = if program.contains('/') {
        let path = PathBuf::from(program);
        let path = if path.is_absolute() {
            path
        } else {
            env::current_dir().ok()?.join(path)
        };
        if !is_executable(&path) {
            return None;
        }
        path
    } else {
        search_in_path(program, search_path)?
    };

    Some(ResolvedCommand {
        program,
        arguments: arguments.to_string(),
    })
}

// Empty path components are not searched.
fn search_in_path(program: &str, search_path: &str) -> Option<PathBuf> {
    search_path
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
