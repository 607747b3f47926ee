use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::artifacts::{ArtifactDigest, ArtifactKind};
use crate::config::{MeasurementBackendKind, ServiceConfig};

// key: measurement-ledger -> append-only register extension

/// Capability to append a digest to a numbered measurement register.
#[async_trait]
pub trait MeasurementBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn extend(&self, register: u32, digest: &ArtifactDigest) -> Result<()>;
}

/// Placeholder backend: records the extension in the log only.
pub struct LogBackend;

#[async_trait]
impl MeasurementBackend for LogBackend {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn extend(&self, register: u32, digest: &ArtifactDigest) -> Result<()> {
        tracing::warn!(
            target: "measurement",
            register,
            %digest,
            "measurement recorded in log only; no hardware register was extended",
        );
        Ok(())
    }
}

/// Extends TPM PCRs in the sha256 bank through `tpm2_pcrextend`.
pub struct Tpm2ToolsBackend {
    program: String,
}

impl Tpm2ToolsBackend {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl MeasurementBackend for Tpm2ToolsBackend {
    fn name(&self) -> &'static str {
        "tpm2-tools"
    }

    async fn extend(&self, register: u32, digest: &ArtifactDigest) -> Result<()> {
        let selector = format!("{register}:sha256={}", digest.to_hex());
        let output = Command::new(&self.program)
            .arg(&selector)
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.program))?;
        if !output.status.success() {
            bail!(
                "{} {} exited with {}: {}",
                self.program,
                selector,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

pub fn backend_from_config(config: &ServiceConfig) -> Arc<dyn MeasurementBackend> {
    match config.measurement_backend {
        MeasurementBackendKind::Log => Arc::new(LogBackend),
        MeasurementBackendKind::Tpm2Tools => {
            Arc::new(Tpm2ToolsBackend::new(config.tpm2_pcrextend_bin.clone()))
        }
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("measurement register {register} unavailable for {kind}: {detail}")]
    Unavailable {
        kind: ArtifactKind,
        register: u32,
        detail: String,
    },
    #[error("register {register} was already extended with the {kind} measurement")]
    AlreadyExtended { kind: ArtifactKind, register: u32 },
    #[error(
        "refusing to extend register {register} with {offered}: a failed extension for {kind} used {attempted}"
    )]
    DigestMismatch {
        kind: ArtifactKind,
        register: u32,
        attempted: ArtifactDigest,
        offered: ArtifactDigest,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementEvent {
    pub kind: ArtifactKind,
    pub register: u32,
    pub digest: ArtifactDigest,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Default)]
struct LedgerState {
    events: Vec<MeasurementEvent>,
    failed_attempts: HashMap<ArtifactKind, ArtifactDigest>,
}

/// Append-only record of register extensions made by this process.
///
/// Each artifact kind is extended at most once. A failed extension may only be
/// retried with the digest that was first offered, since the backend may have
/// applied it before reporting the failure.
pub struct MeasurementLedger {
    backend: Arc<dyn MeasurementBackend>,
    state: Mutex<LedgerState>,
}

impl MeasurementLedger {
    pub fn new(backend: Arc<dyn MeasurementBackend>) -> Self {
        Self {
            backend,
            state: Mutex::new(LedgerState::default()),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub async fn extend(
        &self,
        kind: ArtifactKind,
        digest: ArtifactDigest,
    ) -> Result<MeasurementEvent, LedgerError> {
        let register = kind.register();
        // Held across the backend call so extensions reach the registers in
        // the order they were requested.
        let mut state = self.state.lock().await;

        if state.events.iter().any(|event| event.kind == kind) {
            return Err(LedgerError::AlreadyExtended { kind, register });
        }
        if let Some(attempted) = state.failed_attempts.get(&kind) {
            if *attempted != digest {
                return Err(LedgerError::DigestMismatch {
                    kind,
                    register,
                    attempted: *attempted,
                    offered: digest,
                });
            }
        }

        if let Err(error) = self.backend.extend(register, &digest).await {
            tracing::error!(
                target: "measurement",
                %kind,
                register,
                %digest,
                ?error,
                "register extension failed",
            );
            state.failed_attempts.insert(kind, digest);
            return Err(LedgerError::Unavailable {
                kind,
                register,
                detail: format!("{error:#}"),
            });
        }

        state.failed_attempts.remove(&kind);
        let event = MeasurementEvent {
            kind,
            register,
            digest,
            recorded_at: Utc::now(),
        };
        state.events.push(event.clone());
        tracing::info!(
            target: "measurement",
            %kind,
            register,
            %digest,
            backend = self.backend.name(),
            "extended measurement register",
        );
        Ok(event)
    }

    pub async fn events(&self) -> Vec<MeasurementEvent> {
        self.state.lock().await.events.clone()
    }
}

pub mod testing {
    use super::*;
    use sha2::{Digest, Sha256};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Simulates a sha256 register bank: `new = SHA256(old || digest)`.
    #[derive(Default)]
    pub struct InMemoryBackend {
        registers: std::sync::Mutex<HashMap<u32, [u8; 32]>>,
        calls: std::sync::Mutex<Vec<(u32, ArtifactDigest)>>,
        failing: AtomicBool,
    }

    impl InMemoryBackend {
        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        /// Every successful extension, in order.
        pub fn calls(&self) -> Vec<(u32, ArtifactDigest)> {
            self.calls.lock().map(|c| c.clone()).unwrap_or_default()
        }

        pub fn register_value(&self, register: u32) -> Option<[u8; 32]> {
            self.registers
                .lock()
                .ok()
                .and_then(|r| r.get(&register).copied())
        }

        /// Value a register holds after extending a fresh bank with `digests`.
        pub fn expected_value(digests: &[ArtifactDigest]) -> [u8; 32] {
            digests.iter().fold([0u8; 32], |acc, digest| {
                let mut hasher = Sha256::new();
                hasher.update(acc);
                hasher.update(digest.as_bytes());
                hasher.finalize().into()
            })
        }
    }

    #[async_trait]
    impl MeasurementBackend for InMemoryBackend {
        fn name(&self) -> &'static str {
            "in-memory"
        }

        async fn extend(&self, register: u32, digest: &ArtifactDigest) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                bail!("register {register} rejected the extension");
            }
            let mut registers = self
                .registers
                .lock()
                .map_err(|_| anyhow::anyhow!("register bank poisoned"))?;
            let current = registers.entry(register).or_insert([0u8; 32]);
            let mut hasher = Sha256::new();
            hasher.update(*current);
            hasher.update(digest.as_bytes());
            *current = hasher.finalize().into();
            drop(registers);
            if let Ok(mut calls) = self.calls.lock() {
                calls.push((register, *digest));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::InMemoryBackend;
    use super::*;

    fn ledger() -> (Arc<InMemoryBackend>, MeasurementLedger) {
        let backend = Arc::new(InMemoryBackend::default());
        let ledger = MeasurementLedger::new(backend.clone());
        (backend, ledger)
    }

    #[tokio::test]
    async fn extends_each_kind_into_its_register() {
        let (backend, ledger) = ledger();
        let spec = ArtifactDigest::of(b"spec");
        let env = ArtifactDigest::of(b"env");

        ledger.extend(ArtifactKind::Spec, spec).await.unwrap();
        ledger.extend(ArtifactKind::EnvBundle, env).await.unwrap();

        assert_eq!(backend.calls(), vec![(13, spec), (14, env)]);
        assert_eq!(
            backend.register_value(13),
            Some(InMemoryBackend::expected_value(&[spec]))
        );
        let kinds: Vec<_> = ledger.events().await.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![ArtifactKind::Spec, ArtifactKind::EnvBundle]);
    }

    #[tokio::test]
    async fn second_extension_for_same_kind_is_rejected() {
        let (backend, ledger) = ledger();
        let digest = ArtifactDigest::of(b"spec");
        ledger.extend(ArtifactKind::Spec, digest).await.unwrap();

        let err = ledger.extend(ArtifactKind::Spec, digest).await.unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyExtended { register: 13, .. }));
        assert_eq!(backend.calls().len(), 1);
    }

    #[tokio::test]
    async fn failed_extension_only_retries_identical_digest() {
        let (backend, ledger) = ledger();
        let first = ArtifactDigest::of(b"spec-v1");
        backend.set_failing(true);
        let err = ledger.extend(ArtifactKind::Spec, first).await.unwrap_err();
        assert!(matches!(err, LedgerError::Unavailable { register: 13, .. }));

        backend.set_failing(false);
        let other = ArtifactDigest::of(b"spec-v2");
        let err = ledger.extend(ArtifactKind::Spec, other).await.unwrap_err();
        assert!(matches!(err, LedgerError::DigestMismatch { .. }));

        ledger.extend(ArtifactKind::Spec, first).await.unwrap();
        assert_eq!(backend.calls(), vec![(13, first)]);
    }

    #[tokio::test]
    async fn tpm2_tools_backend_reports_missing_binary() {
        let backend = Tpm2ToolsBackend::new("/nonexistent/tpm2_pcrextend");
        let err = backend
            .extend(13, &ArtifactDigest::of(b"spec"))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("failed to run"));
    }
}
