use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;

use crate::config::ServiceConfig;

/// Sources the bundle with auto-export on, then replaces the shell with the
/// engine command. Paths travel as positional arguments, never as script text.
const ENV_WRAPPER_SCRIPT: &str = r#"set -a; . "$1"; set +a; shift; exec "$@""#;

#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{program} is not installed")]
    NotInstalled { program: String },
    #[error("Container start failed:\nStdout: {stdout}\nStderr: {stderr}\nError: {cause}")]
    Failed {
        stdout: String,
        stderr: String,
        cause: String,
    },
}

/// External executable that starts the workload described by a pod spec.
#[async_trait]
pub trait WorkloadEngine: Send + Sync {
    fn program(&self) -> &str;

    async fn check_available(&self) -> Result<(), EngineError>;

    async fn play(
        &self,
        spec: &Path,
        env_bundle: Option<&Path>,
    ) -> Result<EngineOutput, EngineError>;
}

pub struct PodmanEngine {
    program: String,
    args: Vec<String>,
}

impl PodmanEngine {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(config.engine_program.clone(), config.engine_args.clone())
    }

    fn command(&self, spec: &Path, env_bundle: Option<&Path>) -> Command {
        let mut command = match env_bundle {
            Some(bundle) => {
                let mut command = Command::new("sh");
                command
                    .arg("-c")
                    .arg(ENV_WRAPPER_SCRIPT)
                    .arg("sh")
                    .arg(sourceable(bundle))
                    .arg(&self.program);
                command
            }
            None => Command::new(&self.program),
        };
        command.args(&self.args).arg(spec);
        command
    }
}

#[async_trait]
impl WorkloadEngine for PodmanEngine {
    fn program(&self) -> &str {
        &self.program
    }

    async fn check_available(&self) -> Result<(), EngineError> {
        let program = self.program.clone();
        let found = tokio::task::spawn_blocking(move || resolve_program(&program).is_some())
            .await
            .unwrap_or(false);
        if found {
            Ok(())
        } else {
            Err(EngineError::NotInstalled {
                program: self.program.clone(),
            })
        }
    }

    async fn play(
        &self,
        spec: &Path,
        env_bundle: Option<&Path>,
    ) -> Result<EngineOutput, EngineError> {
        let mut command = self.command(spec, env_bundle);
        // Own process group, so the workload survives this service exiting.
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        tracing::info!(
            program = %self.program,
            spec = %spec.display(),
            env_bundle = ?env_bundle.map(Path::display),
            "starting workload engine",
        );
        let output = command.output().await.map_err(|error| EngineError::Failed {
            stdout: String::new(),
            stderr: String::new(),
            cause: error.to_string(),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            return Err(EngineError::Failed {
                stdout,
                stderr,
                cause: output.status.to_string(),
            });
        }
        Ok(EngineOutput { stdout, stderr })
    }
}

/// `.` searches `PATH` for names without a slash.
fn sourceable(path: &Path) -> PathBuf {
    if path.is_absolute() || path.starts_with(".") {
        path.to_path_buf()
    } else {
        Path::new(".").join(path)
    }
}

/// Locates `program` the way `execvp` would.
pub fn resolve_program(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        let candidate = PathBuf::from(program);
        return is_executable(&candidate).then_some(candidate);
    }
    let search_path = std::env::var_os("PATH")?;
    std::env::split_paths(&search_path)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
