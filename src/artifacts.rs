use serde::Serialize;
use sha2::{Digest, Sha256};

/// Register the pod specification is extended into.
pub const SPEC_REGISTER: u32 = 13;
/// Register the environment bundle is extended into.
pub const ENV_BUNDLE_REGISTER: u32 = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ArtifactKind {
    Spec,
    EnvBundle,
}

impl ArtifactKind {
    /// Measurement order. The spec always comes first.
    pub const ALL: [ArtifactKind; 2] = [ArtifactKind::Spec, ArtifactKind::EnvBundle];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Spec => "spec",
            ArtifactKind::EnvBundle => "env-bundle",
        }
    }

    /// File name inside the provisioning directory.
    pub fn file_name(&self) -> &'static str {
        match self {
            ArtifactKind::Spec => "pod.yaml",
            ArtifactKind::EnvBundle => "env",
        }
    }

    pub fn register(&self) -> u32 {
        match self {
            ArtifactKind::Spec => SPEC_REGISTER,
            ArtifactKind::EnvBundle => ENV_BUNDLE_REGISTER,
        }
    }

    /// Multipart part name carrying this artifact.
    pub fn part_name(&self) -> &'static str {
        match self {
            ArtifactKind::Spec => "podSpec",
            ArtifactKind::EnvBundle => "envBundle",
        }
    }

    /// Maps a multipart part name, including the legacy `pod.yaml`/`env`
    /// names, to its artifact kind.
    pub fn from_part_name(name: &str) -> Option<Self> {
        match name {
            "podSpec" | "pod.yaml" => Some(ArtifactKind::Spec),
            "envBundle" | "env" => Some(ArtifactKind::EnvBundle),
            _ => None,
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SHA-256 over the artifact content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArtifactDigest([u8; 32]);

impl ArtifactDigest {
    pub fn of(content: &[u8]) -> Self {
        Self(Sha256::digest(content).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for ArtifactDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sha256:{}", self.to_hex())
    }
}

impl Serialize for ArtifactDigest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
