//! Launch command resolution and process construction.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use mcp_bridge_core::{ConnectError, ServerParams, StdioConfig};
use tokio::process::Command;

/// Parsed command parts (program + args).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandParts {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandParts {
    /// Create new command parts.
    #[must_use]
    pub const fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }

    /// Resolve the program to a path, relative ones against `cwd` if set.
    ///
    /// # Errors
    /// Returns error if executable not found.
    pub async fn into_resolved(
        self,
        cwd: Option<&Path>,
    ) -> Result<(PathBuf, Vec<String>), ConnectError> {
        let Self { program, args } = self;
        let executable = resolve_executable_path(&program, cwd)
            .await
            .ok_or(ConnectError::ExecutableNotFound(program))?;
        Ok((executable, args))
    }
}

impl From<&ServerParams> for CommandParts {
    fn from(params: &ServerParams) -> Self {
        Self::new(params.command.clone(), params.args.clone())
    }
}

/// Resolve an executable by name.
///
/// Paths that already point at a file are used as is; bare names are
/// looked up on `PATH` via `which`. Relative paths such as `./server` are
/// taken from `cwd`, the directory the child will start in, when given.
pub async fn resolve_executable_path(executable: &str, cwd: Option<&Path>) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.is_absolute() && path.is_file() {
        return Some(path.to_path_buf());
    }

    which_async(executable, cwd).await
}

async fn which_async(executable: &str, cwd: Option<&Path>) -> Option<PathBuf> {
    let executable = executable.to_string();
    let cwd = cwd.map(Path::to_path_buf);
    tokio::task::spawn_blocking(move || match cwd {
        Some(cwd) => which::which_in(executable, std::env::var_os("PATH"), cwd),
        None => which::which(executable),
    })
    .await
    .ok()
    .and_then(Result::ok)
}

/// Build the child command for a resolved executable.
///
/// stdin and stdout are piped for the protocol; stderr is inherited or
/// discarded per `config`. The child is killed if its handle is dropped.
#[must_use]
pub fn build_command(
    executable: &Path,
    args: &[String],
    params: &ServerParams,
    config: &StdioConfig,
) -> Command {
    let mut cmd = Command::new(executable);
    cmd.args(args)
        .envs(&params.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(if config.inherit_stderr {
            Stdio::inherit()
        } else {
            Stdio::null()
        })
        .kill_on_drop(true);
    if let Some(cwd) = &params.cwd {
        cmd.current_dir(cwd);
    }
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_blank_executable_is_not_resolved() {
        assert!(resolve_executable_path("  ", None).await.is_none());
    }

    #[tokio::test]
    async fn test_missing_executable_is_reported_by_name() {
        let parts = CommandParts::new("nonexistent_binary_for_tests".to_string(), vec![]);
        let err = parts.into_resolved(None).await.unwrap_err();
        assert!(
            matches!(err, ConnectError::ExecutableNotFound(ref name) if name == "nonexistent_binary_for_tests")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_resolves_shell_from_path() {
        let parts = CommandParts::new("sh".to_string(), vec!["-c".to_string()]);
        let (path, args) = parts.into_resolved(None).await.unwrap();
        assert!(path.is_absolute());
        assert_eq!(args, vec!["-c"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_relative_executable_resolves_against_cwd() {
        use std::os::unix::fs::PermissionsExt;

        let dir = std::env::temp_dir().join(format!("mcp-bridge-cwd-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let script = dir.join("local-server");
        std::fs::write(&script, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let found = resolve_executable_path("./local-server", Some(&dir)).await;
        assert_eq!(found.as_deref(), Some(script.as_path()));
        assert!(resolve_executable_path("./local-server", None).await.is_none());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_parts_from_params() {
        let params = ServerParams::parse("python echo_server.py").unwrap();
        let parts = CommandParts::from(&params);
        assert_eq!(parts.program, "python");
        assert_eq!(parts.args, vec!["echo_server.py"]);
    }
}
