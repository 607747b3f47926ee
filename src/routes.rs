use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Extension, Multipart},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::Serialize;
use tracing::debug;

use crate::artifacts::ArtifactKind;
use crate::error::{AppError, AppResult};
use crate::launch::{LaunchOutcome, LaunchReport};
use crate::measurement::MeasurementEvent;
use crate::state::AppState;
use crate::store::{ProvisionedArtifact, ProvisioningState};

/// Room for multipart framing on top of the two artifacts.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

async fn root() -> &'static str {
    "Measured launch API"
}

pub fn app(state: Arc<AppState>) -> Router {
    let body_limit = state
        .store
        .max_artifact_bytes()
        .saturating_mul(2)
        .saturating_add(MULTIPART_OVERHEAD_BYTES);
    Router::new()
        .route("/", get(root))
        .route("/upload", post(upload))
        .route("/start", post(start))
        .route("/status", get(status))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(Extension(state))
}

#[derive(Serialize)]
pub struct ProvisionResponse {
    pub state: ProvisioningState,
    pub artifacts: Vec<ProvisionedArtifact>,
}

pub async fn upload(
    Extension(state): Extension<Arc<AppState>>,
    mut multipart: Multipart,
) -> AppResult<(StatusCode, Json<ProvisionResponse>)> {
    let mut spec: Option<Bytes> = None;
    let mut env_bundle: Option<Bytes> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("failed to parse form: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let Some(kind) = ArtifactKind::from_part_name(&name) else {
            debug!(part = %name, "ignoring unknown form part");
            continue;
        };
        let data = field
            .bytes()
            .await
            .map_err(|e| AppError::BadRequest(format!("failed to read {name}: {e}")))?;
        let slot = match kind {
            ArtifactKind::Spec => &mut spec,
            ArtifactKind::EnvBundle => &mut env_bundle,
        };
        if slot.replace(data).is_some() {
            return Err(AppError::BadRequest(format!(
                "{} supplied more than once",
                kind.part_name()
            )));
        }
    }

    let spec = spec.ok_or_else(|| {
        AppError::BadRequest(format!("{} is required", ArtifactKind::Spec.part_name()))
    })?;
    let artifacts = state.store.provision_bundle(spec, env_bundle).await?;
    Ok((
        StatusCode::CREATED,
        Json(ProvisionResponse {
            state: state.store.state().await,
            artifacts,
        }),
    ))
}

pub async fn start(
    Extension(state): Extension<Arc<AppState>>,
) -> AppResult<Json<LaunchReport>> {
    let report = state.launcher.launch().await?;
    Ok(Json(report))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactStatus {
    pub kind: ArtifactKind,
    pub path: String,
    pub register: u32,
    pub present: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub state: ProvisioningState,
    pub measurement_backend: &'static str,
    pub artifacts: Vec<ArtifactStatus>,
    pub measurements: Vec<MeasurementEvent>,
    pub launch: Option<LaunchOutcome>,
}

pub async fn status(Extension(state): Extension<Arc<AppState>>) -> Json<StatusResponse> {
    let mut artifacts = Vec::with_capacity(ArtifactKind::ALL.len());
    for kind in ArtifactKind::ALL {
        artifacts.push(ArtifactStatus {
            kind,
            path: state.store.artifact_path(kind).display().to_string(),
            register: kind.register(),
            present: state.store.exists(kind).await,
        });
    }
    Json(StatusResponse {
        state: state.store.state().await,
        measurement_backend: state.ledger.backend_name(),
        artifacts,
        measurements: state.ledger.events().await,
        launch: state.launcher.last_outcome().await,
    })
}
