use once_cell::sync::Lazy;
use std::path::PathBuf;
use thiserror::Error;

/// Address the HTTP server should bind to. Defaults to `0.0.0.0`.
pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()));

/// Port the HTTP server should listen on. Defaults to `24070`.
pub static BIND_PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("BIND_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(24070)
});

pub const DEFAULT_PROVISION_DIR: &str = "/tmp";
pub const DEFAULT_MAX_ARTIFACT_BYTES: usize = 10 << 20;
pub const DEFAULT_WORKLOAD_ENGINE: &str = "podman";
pub const DEFAULT_WORKLOAD_ENGINE_ARGS: &str = "play kube";
pub const DEFAULT_TPM2_PCREXTEND_BIN: &str = "tpm2_pcrextend";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementBackendKind {
    /// Logs each extension without touching hardware.
    Log,
    /// Shells out to `tpm2_pcrextend`.
    Tpm2Tools,
}

impl MeasurementBackendKind {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "log" => Ok(Self::Log),
            "tpm2-tools" | "tpm2_tools" | "tpm" => Ok(Self::Tpm2Tools),
            other => Err(ConfigError::UnknownMeasurementBackend(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Tpm2Tools => "tpm2-tools",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown MEASUREMENT_BACKEND `{0}` (expected `log` or `tpm2-tools`)")]
    UnknownMeasurementBackend(String),
    #[error("MAX_ARTIFACT_BYTES must be a positive integer, got `{0}`")]
    InvalidMaxArtifactBytes(String),
    #[error("WORKLOAD_ENGINE must not be empty")]
    EmptyWorkloadEngine,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub provision_dir: PathBuf,
    pub max_artifact_bytes: usize,
    pub engine_program: String,
    pub engine_args: Vec<String>,
    pub measurement_backend: MeasurementBackendKind,
    pub tpm2_pcrextend_bin: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            provision_dir: PathBuf::from(DEFAULT_PROVISION_DIR),
            max_artifact_bytes: DEFAULT_MAX_ARTIFACT_BYTES,
            engine_program: DEFAULT_WORKLOAD_ENGINE.to_string(),
            engine_args: split_args(DEFAULT_WORKLOAD_ENGINE_ARGS),
            measurement_backend: MeasurementBackendKind::Log,
            tpm2_pcrextend_bin: DEFAULT_TPM2_PCREXTEND_BIN.to_string(),
        }
    }
}

/// Builds the service configuration from the process environment.
///
/// Unset or blank variables fall back to their defaults; malformed values are
/// reported so that the binary can refuse to start.
pub fn service_config_from_env() -> Result<ServiceConfig, ConfigError> {
    let defaults = ServiceConfig::default();

    let provision_dir = read_optional_env("PROVISION_DIR")
        .map(PathBuf::from)
        .unwrap_or(defaults.provision_dir);

    let max_artifact_bytes = match read_optional_env("MAX_ARTIFACT_BYTES") {
        Some(raw) => raw
            .parse::<usize>()
            .ok()
            .filter(|value| *value > 0)
            .ok_or(ConfigError::InvalidMaxArtifactBytes(raw))?,
        None => defaults.max_artifact_bytes,
    };

    let engine_program = match std::env::var("WORKLOAD_ENGINE") {
        Ok(value) if value.trim().is_empty() => return Err(ConfigError::EmptyWorkloadEngine),
        Ok(value) => value.trim().to_string(),
        Err(_) => defaults.engine_program,
    };

    let engine_args = read_optional_env("WORKLOAD_ENGINE_ARGS")
        .map(|raw| split_args(&raw))
        .unwrap_or(defaults.engine_args);

    let measurement_backend = match read_optional_env("MEASUREMENT_BACKEND") {
        Some(raw) => MeasurementBackendKind::parse(&raw)?,
        None => defaults.measurement_backend,
    };

    let tpm2_pcrextend_bin =
        read_optional_env("TPM2_PCREXTEND_BIN").unwrap_or(defaults.tpm2_pcrextend_bin);

    Ok(ServiceConfig {
        provision_dir,
        max_artifact_bytes,
        engine_program,
        engine_args,
        measurement_backend,
        tpm2_pcrextend_bin,
    })
}

fn split_args(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(ToString::to_string).collect()
}

fn read_optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_kind_parses_known_names() {
        assert_eq!(
            MeasurementBackendKind::parse("LOG").unwrap(),
            MeasurementBackendKind::Log
        );
        assert_eq!(
            MeasurementBackendKind::parse(" tpm2-tools ").unwrap(),
            MeasurementBackendKind::Tpm2Tools
        );
        assert_eq!(
            MeasurementBackendKind::parse("sgx"),
            Err(ConfigError::UnknownMeasurementBackend("sgx".to_string()))
        );
    }

    #[test]
    fn default_engine_invocation_is_podman_play_kube() {
        let config = ServiceConfig::default();
        assert_eq!(config.engine_program, "podman");
        assert_eq!(config.engine_args, vec!["play", "kube"]);
        assert_eq!(config.max_artifact_bytes, 10 * 1024 * 1024);
    }
}
