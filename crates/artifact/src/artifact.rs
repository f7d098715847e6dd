//! The artifact record and artifact naming

use crate::error::{ArtifactError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use weir_cas::{Digest, ObjectStore};

/// URN template naming artifacts on remote asset caches
pub const ARTIFACT_URN_TEMPLATE: &str = "urn:fdc:buildstream.build:2020:artifact:";

/// Current artifact record version
pub const ARTIFACT_VERSION: u32 = 2;

/// The `project/element/key` name an artifact ref is stored under
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactName {
    /// Project the element belongs to
    pub project: String,
    /// Normalized element name
    pub element: String,
    /// Cache key (strong or weak) in hex
    pub key: String,
}

impl ArtifactName {
    /// Compose a name from its parts.
    pub fn new(
        project: impl Into<String>,
        element: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            element: element.into(),
            key: key.into(),
        }
    }

    /// The URN this artifact is published under on remotes.
    #[must_use]
    pub fn urn(&self) -> String {
        format!("{ARTIFACT_URN_TEMPLATE}{self}")
    }
}

impl fmt::Display for ArtifactName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.project, self.element, self.key)
    }
}

/// One preserved log file of the jobs that produced an artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Action the log came from (e.g. `build`)
    pub name: String,
    /// Blob digest of the log contents
    pub digest: Digest,
}

/// The stored record describing one cached artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Record format version
    pub version: u32,
    /// Cache key over dependency content
    pub strong_key: String,
    /// Cache key over dependency names only
    pub weak_key: String,
    /// Root digest of the output file tree
    pub files: Option<Digest>,
    /// Root digest of the preserved build tree, if kept
    pub buildtree: Option<Digest>,
    /// Root digest of the staged sources, if kept
    pub sources: Option<Digest>,
    /// Digest of the opaque public data blob
    pub public_data: Option<Digest>,
    /// Preserved job logs
    pub logs: Vec<LogEntry>,
    /// Names of the build dependencies that were staged
    pub build_deps: Vec<String>,
}

impl Artifact {
    /// Canonical byte encoding of the record.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ArtifactError::decode(e.to_string()))
    }

    /// Decode a record from its canonical bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| ArtifactError::decode(e.to_string()))
    }

    /// Serialize and write the record into the store.
    pub fn store(&self, store: &ObjectStore) -> Result<Digest> {
        Ok(store.put_bytes(&self.encode()?)?)
    }

    /// Read and decode a record blob.
    pub fn load(store: &ObjectStore, digest: &Digest) -> Result<Self> {
        Self::decode(&store.read(digest)?)
    }

    /// Directory roots this artifact references.
    #[must_use]
    pub fn referenced_directories(&self) -> Vec<Digest> {
        [&self.files, &self.buildtree, &self.sources]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }

    /// Plain blobs this artifact references (logs and public data).
    #[must_use]
    pub fn referenced_blobs(&self) -> Vec<Digest> {
        let mut blobs: Vec<Digest> = self.logs.iter().map(|l| l.digest.clone()).collect();
        if let Some(public) = &self.public_data {
            blobs.push(public.clone());
        }
        blobs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Artifact {
        Artifact {
            version: ARTIFACT_VERSION,
            strong_key: "ab".repeat(32),
            weak_key: "cd".repeat(32),
            files: Some(Digest::from_bytes(b"files")),
            buildtree: None,
            sources: None,
            public_data: Some(Digest::from_bytes(b"public")),
            logs: vec![LogEntry {
                name: "build".to_string(),
                digest: Digest::from_bytes(b"log"),
            }],
            build_deps: vec!["base.bst".to_string()],
        }
    }

    #[test]
    fn record_round_trips() {
        let artifact = sample();
        let decoded = Artifact::decode(&artifact.encode().unwrap()).unwrap();
        assert_eq!(decoded, artifact);
    }

    #[test]
    fn encoding_is_deterministic() {
        assert_eq!(sample().encode().unwrap(), sample().encode().unwrap());
    }

    #[test]
    fn name_display_and_urn() {
        let name = ArtifactName::new("proj", "app-main", "ff".repeat(32));
        assert_eq!(name.to_string(), format!("proj/app-main/{}", "ff".repeat(32)));
        assert!(name.urn().starts_with("urn:fdc:buildstream.build:2020:artifact:proj/"));
    }

    #[test]
    fn referenced_sets() {
        let artifact = sample();
        assert_eq!(artifact.referenced_directories().len(), 1);
        // log + public data
        assert_eq!(artifact.referenced_blobs().len(), 2);
    }
}
