use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Mutex;

use measured_launch::config::{service_config_from_env, ConfigError, MeasurementBackendKind};
use once_cell::sync::Lazy;

static ENV_GUARD: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

const KEYS: &[&str] = &[
    "PROVISION_DIR",
    "MAX_ARTIFACT_BYTES",
    "WORKLOAD_ENGINE",
    "WORKLOAD_ENGINE_ARGS",
    "MEASUREMENT_BACKEND",
    "TPM2_PCREXTEND_BIN",
];

fn with_env<T>(vars: &[(&str, Option<&str>)], f: impl FnOnce() -> T) -> T {
    let guard = ENV_GUARD.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let mut previous = Vec::with_capacity(KEYS.len());
    for key in KEYS {
        previous.push(((*key).to_string(), std::env::var(key).ok()));
        std::env::remove_var(key);
    }
    for (key, value) in vars {
        if let Some(val) = value {
            std::env::set_var(key, val);
        }
    }

    let result = catch_unwind(AssertUnwindSafe(f));

    for (key, old) in previous.into_iter() {
        if let Some(val) = old {
            std::env::set_var(&key, val);
        } else {
            std::env::remove_var(&key);
        }
    }

    drop(guard);

    match result {
        Ok(value) => value,
        Err(panic) => resume_unwind(panic),
    }
}

#[test]
fn defaults_match_original_layout() {
    let config = with_env(&[], service_config_from_env).unwrap();
    assert_eq!(config.provision_dir, PathBuf::from("/tmp"));
    assert_eq!(config.max_artifact_bytes, 10 << 20);
    assert_eq!(config.engine_program, "podman");
    assert_eq!(config.engine_args, vec!["play", "kube"]);
    assert_eq!(config.measurement_backend, MeasurementBackendKind::Log);
    assert_eq!(config.tpm2_pcrextend_bin, "tpm2_pcrextend");
}

#[test]
fn overrides_are_read_from_environment() {
    let config = with_env(
        &[
            ("PROVISION_DIR", Some("/var/lib/measured-launch")),
            ("MAX_ARTIFACT_BYTES", Some("4096")),
            ("WORKLOAD_ENGINE", Some("/usr/local/bin/podman")),
            ("WORKLOAD_ENGINE_ARGS", Some("kube play --replace")),
            ("MEASUREMENT_BACKEND", Some("tpm2-tools")),
            ("TPM2_PCREXTEND_BIN", Some("/opt/tpm2/bin/tpm2_pcrextend")),
        ],
        service_config_from_env,
    )
    .unwrap();
    assert_eq!(config.provision_dir, PathBuf::from("/var/lib/measured-launch"));
    assert_eq!(config.max_artifact_bytes, 4096);
    assert_eq!(config.engine_program, "/usr/local/bin/podman");
    assert_eq!(config.engine_args, vec!["kube", "play", "--replace"]);
    assert_eq!(config.measurement_backend, MeasurementBackendKind::Tpm2Tools);
    assert_eq!(config.tpm2_pcrextend_bin, "/opt/tpm2/bin/tpm2_pcrextend");
}

#[test]
fn malformed_values_are_rejected() {
    let err = with_env(&[("MEASUREMENT_BACKEND", Some("sgx"))], service_config_from_env)
        .unwrap_err();
    assert_eq!(err, ConfigError::UnknownMeasurementBackend("sgx".to_string()));

    let err = with_env(&[("MAX_ARTIFACT_BYTES", Some("0"))], service_config_from_env)
        .unwrap_err();
    assert_eq!(err, ConfigError::InvalidMaxArtifactBytes("0".to_string()));

    let err = with_env(&[("WORKLOAD_ENGINE", Some("  "))], service_config_from_env)
        .unwrap_err();
    assert_eq!(err, ConfigError::EmptyWorkloadEngine);
}
