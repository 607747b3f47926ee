use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::artifacts::{ArtifactDigest, ArtifactKind};
use crate::measurement::{LedgerError, MeasurementLedger};

const TEMP_SUFFIX: &str = ".partial";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{} already exists", .kind.file_name())]
    AlreadyProvisioned { kind: ArtifactKind },
    #[error("{kind} is {size} bytes; the limit is {limit} bytes")]
    TooLarge {
        kind: ArtifactKind,
        size: usize,
        limit: usize,
    },
    #[error("failed to {action} {}: {source}", .kind.file_name())]
    Io {
        kind: ArtifactKind,
        action: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to measure {}: {source}", .kind.file_name())]
    Measurement {
        kind: ArtifactKind,
        #[source]
        source: LedgerError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ProvisioningState {
    Empty,
    SpecProvisioned,
    FullyProvisioned,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionedArtifact {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub register: u32,
    pub digest: ArtifactDigest,
    pub size: usize,
}

/// Write-once storage for the provisioned artifacts.
///
/// Presence of an artifact file is the only record of provisioning progress;
/// nothing is cached in memory, so a restarted process resumes from whatever
/// is on disk.
pub struct ProvisioningStore {
    dir: PathBuf,
    max_artifact_bytes: usize,
    ledger: Arc<MeasurementLedger>,
    spec_lock: Mutex<()>,
    env_bundle_lock: Mutex<()>,
}

impl ProvisioningStore {
    pub fn new(
        dir: impl Into<PathBuf>,
        max_artifact_bytes: usize,
        ledger: Arc<MeasurementLedger>,
    ) -> Self {
        Self {
            dir: dir.into(),
            max_artifact_bytes,
            ledger,
            spec_lock: Mutex::new(()),
            env_bundle_lock: Mutex::new(()),
        }
    }

    /// Creates the provisioning directory and removes temporary files left
    /// behind by an interrupted write. Returns the number of files removed.
    pub async fn prepare(&self) -> std::io::Result<usize> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if ArtifactKind::ALL
                .iter()
                .any(|kind| is_temp_name_for(*kind, name))
            {
                tokio::fs::remove_file(entry.path()).await?;
                tracing::warn!(path = %entry.path().display(), "removed stale partial artifact");
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_artifact_bytes(&self) -> usize {
        self.max_artifact_bytes
    }

    pub fn artifact_path(&self, kind: ArtifactKind) -> PathBuf {
        self.dir.join(kind.file_name())
    }

    pub async fn exists(&self, kind: ArtifactKind) -> bool {
        tokio::fs::metadata(self.artifact_path(kind)).await.is_ok()
    }

    pub async fn state(&self) -> ProvisioningState {
        if !self.exists(ArtifactKind::Spec).await {
            ProvisioningState::Empty
        } else if self.exists(ArtifactKind::EnvBundle).await {
            ProvisioningState::FullyProvisioned
        } else {
            ProvisioningState::SpecProvisioned
        }
    }

    /// Persisted content of an artifact, or `None` if it was never provisioned.
    pub async fn read(&self, kind: ArtifactKind) -> std::io::Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.artifact_path(kind)).await {
            Ok(content) => Ok(Some(content)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error),
        }
    }

    fn lock_for(&self, kind: ArtifactKind) -> &Mutex<()> {
        match kind {
            ArtifactKind::Spec => &self.spec_lock,
            ArtifactKind::EnvBundle => &self.env_bundle_lock,
        }
    }

    /// Persists and measures a single artifact.
    pub async fn provision(
        &self,
        kind: ArtifactKind,
        content: Bytes,
    ) -> Result<ProvisionedArtifact, StoreError> {
        let _guard = self.lock_for(kind).lock().await;
        self.check_acceptable(kind, &content).await?;
        self.persist_and_measure(kind, content).await
    }

    /// Provisions a spec and an optional environment bundle as one request.
    ///
    /// Both artifacts are checked before anything is written, and the spec is
    /// always persisted and measured before the bundle. An empty bundle is
    /// treated as absent.
    pub async fn provision_bundle(
        &self,
        spec: Bytes,
        env_bundle: Option<Bytes>,
    ) -> Result<Vec<ProvisionedArtifact>, StoreError> {
        let env_bundle = env_bundle.filter(|content| !content.is_empty());

        let _spec_guard = self.spec_lock.lock().await;
        let _env_guard = match env_bundle {
            Some(_) => Some(self.env_bundle_lock.lock().await),
            None => None,
        };

        self.check_acceptable(ArtifactKind::Spec, &spec).await?;
        if let Some(content) = env_bundle.as_ref() {
            self.check_acceptable(ArtifactKind::EnvBundle, content)
                .await?;
        }

        let mut provisioned = vec![self.persist_and_measure(ArtifactKind::Spec, spec).await?];
        if let Some(content) = env_bundle {
            provisioned.push(
                self.persist_and_measure(ArtifactKind::EnvBundle, content)
                    .await?,
            );
        }
        Ok(provisioned)
    }

    async fn check_acceptable(&self, kind: ArtifactKind, content: &[u8]) -> Result<(), StoreError> {
        if self.exists(kind).await {
            return Err(StoreError::AlreadyProvisioned { kind });
        }
        if content.len() > self.max_artifact_bytes {
            return Err(StoreError::TooLarge {
                kind,
                size: content.len(),
                limit: self.max_artifact_bytes,
            });
        }
        Ok(())
    }

    /// Callers must hold the lock for `kind` and have checked that the
    /// artifact is absent.
    async fn persist_and_measure(
        &self,
        kind: ArtifactKind,
        content: Bytes,
    ) -> Result<ProvisionedArtifact, StoreError> {
        let dir = self.dir.clone();
        let written = tokio::task::spawn_blocking(move || write_atomically(&dir, kind, &content)).await;
        let path = match written {
            Ok(result) => result?,
            Err(error) => {
                // The writer may have died after the rename.
                self.roll_back(kind, &self.artifact_path(kind)).await;
                return Err(StoreError::Io {
                    kind,
                    action: "write",
                    source: std::io::Error::new(std::io::ErrorKind::Other, error),
                });
            }
        };
        tracing::info!(%kind, path = %path.display(), "persisted artifact");

        // Measure what is on disk, not the request buffer.
        let persisted = tokio::fs::read(&path)
            .await
            .map_err(|source| StoreError::Io {
                kind,
                action: "read back",
                source,
            });
        let persisted = match persisted {
            Ok(persisted) => persisted,
            Err(error) => {
                self.roll_back(kind, &path).await;
                return Err(error);
            }
        };
        let digest = ArtifactDigest::of(&persisted);

        if let Err(source) = self.ledger.extend(kind, digest).await {
            self.roll_back(kind, &path).await;
            return Err(StoreError::Measurement { kind, source });
        }

        Ok(ProvisionedArtifact {
            kind,
            path,
            register: kind.register(),
            digest,
            size: persisted.len(),
        })
    }

    /// Removes an artifact that was persisted but could not be measured.
    async fn roll_back(&self, kind: ArtifactKind, path: &Path) {
        match tokio::fs::remove_file(path).await {
            Ok(()) => tracing::warn!(%kind, path = %path.display(), "removed unmeasured artifact"),
            Err(error) => tracing::error!(
                %kind,
                path = %path.display(),
                ?error,
                "failed to remove unmeasured artifact",
            ),
        }
    }
}

fn temp_prefix(kind: ArtifactKind) -> String {
    format!(".{}.", kind.file_name())
}

fn is_temp_name_for(kind: ArtifactKind, name: &str) -> bool {
    name.starts_with(&temp_prefix(kind)) && name.ends_with(TEMP_SUFFIX)
}

/// Writes `content` to a temporary file in `dir`, syncs it and moves it into
/// place without replacing an existing file. On every error path neither the
/// temporary file nor the target is left behind.
fn write_atomically(dir: &Path, kind: ArtifactKind, content: &[u8]) -> Result<PathBuf, StoreError> {
    write_atomically_with(dir, kind, content, sync_dir)
}

fn sync_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::File::open(dir)?.sync_all()
}

fn write_atomically_with(
    dir: &Path,
    kind: ArtifactKind,
    content: &[u8],
    sync_dir: impl FnOnce(&Path) -> std::io::Result<()>,
) -> Result<PathBuf, StoreError> {
    let io_error = |action: &'static str| {
        move |source: std::io::Error| StoreError::Io {
            kind,
            action,
            source,
        }
    };
    let target = dir.join(kind.file_name());

    let mut temp = tempfile::Builder::new()
        .prefix(&temp_prefix(kind))
        .suffix(TEMP_SUFFIX)
        .tempfile_in(dir)
        .map_err(io_error("create temporary file for"))?;
    temp.write_all(content)
        .map_err(io_error("write temporary file for"))?;
    temp.as_file()
        .sync_all()
        .map_err(io_error("sync temporary file for"))?;
    temp.persist_noclobber(&target).map_err(|error| {
        if error.error.kind() == std::io::ErrorKind::AlreadyExists {
            StoreError::AlreadyProvisioned { kind }
        } else {
            StoreError::Io {
                kind,
                action: "rename temporary file for",
                source: error.error,
            }
        }
    })?;
    // The target is visible from here on.
    if let Err(source) = sync_dir(dir) {
        if let Err(error) = std::fs::remove_file(&target) {
            tracing::error!(%kind, path = %target.display(), ?error, "failed to remove unsynced artifact");
        }
        return Err(io_error("sync directory of")(source));
    }
    Ok(target)
}
