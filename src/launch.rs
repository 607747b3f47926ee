use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::artifacts::ArtifactKind;
use crate::engine::{EngineError, WorkloadEngine};
use crate::shutdown::ShutdownSignal;
use crate::store::ProvisioningStore;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("{} not found", ArtifactKind::Spec.file_name())]
    MissingSpec,
    #[error("workload already launched")]
    AlreadyLaunched,
    #[error(transparent)]
    Engine(#[from] EngineError),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum LaunchOutcome {
    Success {
        finished_at: DateTime<Utc>,
    },
    Failure {
        detail: String,
        finished_at: DateTime<Utc>,
    },
}

impl LaunchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, LaunchOutcome::Success { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchReport {
    pub spec: PathBuf,
    pub env_bundle: Option<PathBuf>,
    pub stdout: String,
}

/// Starts the provisioned workload at most once.
pub struct LaunchController {
    store: Arc<ProvisioningStore>,
    engine: Arc<dyn WorkloadEngine>,
    shutdown: ShutdownSignal,
    // Held for the whole launch so only one engine invocation runs at a time.
    launch_lock: Mutex<()>,
    outcome: Mutex<Option<LaunchOutcome>>,
}

impl LaunchController {
    pub fn new(
        store: Arc<ProvisioningStore>,
        engine: Arc<dyn WorkloadEngine>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            store,
            engine,
            shutdown,
            launch_lock: Mutex::new(()),
            outcome: Mutex::new(None),
        }
    }

    pub async fn launch(&self) -> Result<LaunchReport, LaunchError> {
        let _launching = self.launch_lock.lock().await;
        if self
            .last_outcome()
            .await
            .as_ref()
            .is_some_and(LaunchOutcome::is_success)
        {
            return Err(LaunchError::AlreadyLaunched);
        }

        if !self.store.exists(ArtifactKind::Spec).await {
            return Err(LaunchError::MissingSpec);
        }
        let spec = self.store.artifact_path(ArtifactKind::Spec);
        let env_bundle = if self.store.exists(ArtifactKind::EnvBundle).await {
            Some(self.store.artifact_path(ArtifactKind::EnvBundle))
        } else {
            None
        };

        let result = match self.engine.check_available().await {
            Ok(()) => self.engine.play(&spec, env_bundle.as_deref()).await,
            Err(error) => Err(error),
        };

        match result {
            Ok(output) => {
                tracing::info!(
                    program = self.engine.program(),
                    stdout = %output.stdout,
                    "Container started successfully",
                );
                self.record(LaunchOutcome::Success {
                    finished_at: Utc::now(),
                })
                .await;
                self.shutdown.trigger();
                Ok(LaunchReport {
                    spec,
                    env_bundle,
                    stdout: output.stdout,
                })
            }
            Err(error) => {
                tracing::error!(program = self.engine.program(), %error, "Error starting container");
                self.record(LaunchOutcome::Failure {
                    detail: error.to_string(),
                    finished_at: Utc::now(),
                })
                .await;
                Err(error.into())
            }
        }
    }

    /// Outcome of the most recent finished launch. Does not wait for a
    /// launch in progress.
    pub async fn last_outcome(&self) -> Option<LaunchOutcome> {
        self.outcome.lock().await.clone()
    }

    async fn record(&self, outcome: LaunchOutcome) {
        *self.outcome.lock().await = Some(outcome);
    }
}

pub mod testing {
    use super::*;
    use crate::engine::EngineOutput;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::watch;

    /// Records invocations instead of starting anything.
    pub struct RecordingEngine {
        missing: AtomicBool,
        failing: AtomicBool,
        invocations: std::sync::Mutex<Vec<(PathBuf, Option<PathBuf>)>>,
        // `play` waits while this is false.
        gate: watch::Sender<bool>,
    }

    impl Default for RecordingEngine {
        fn default() -> Self {
            Self {
                missing: AtomicBool::new(false),
                failing: AtomicBool::new(false),
                invocations: std::sync::Mutex::new(Vec::new()),
                gate: watch::channel(true).0,
            }
        }
    }

    impl RecordingEngine {
        /// Makes subsequent `play` calls block until [`Self::release`].
        pub fn hold(&self) {
            self.gate.send_replace(false);
        }

        pub fn release(&self) {
            self.gate.send_replace(true);
        }

        pub fn set_missing(&self, missing: bool) {
            self.missing.store(missing, Ordering::SeqCst);
        }

        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        pub fn invocations(&self) -> Vec<(PathBuf, Option<PathBuf>)> {
            self.invocations
                .lock()
                .map(|calls| calls.clone())
                .unwrap_or_default()
        }
    }

    #[async_trait::async_trait]
    impl WorkloadEngine for RecordingEngine {
        fn program(&self) -> &str {
            "recording-engine"
        }

        async fn check_available(&self) -> Result<(), EngineError> {
            if self.missing.load(Ordering::SeqCst) {
                return Err(EngineError::NotInstalled {
                    program: self.program().to_string(),
                });
            }
            Ok(())
        }

        async fn play(
            &self,
            spec: &Path,
            env_bundle: Option<&Path>,
        ) -> Result<EngineOutput, EngineError> {
            if let Ok(mut calls) = self.invocations.lock() {
                calls.push((spec.to_path_buf(), env_bundle.map(Path::to_path_buf)));
            }
            let mut gate = self.gate.subscribe();
            while !*gate.borrow_and_update() {
                if gate.changed().await.is_err() {
                    break;
                }
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(EngineError::Failed {
                    stdout: String::new(),
                    stderr: "pod rejected".to_string(),
                    cause: "exit status: 125".to_string(),
                });
            }
            Ok(EngineOutput {
                stdout: "pod started".to_string(),
                stderr: String::new(),
            })
        }
    }
}
