//! Artifact storage for a single pipeline run
//!
//! Payloads are content-addressed by their sha-256 digest and bound to a
//! name. A name can be bound once per run.

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use thiserror::Error;

static ARTIFACT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.\-]+$").unwrap());

/// Whether `name` can be used as an artifact name
///
/// Artifact names double as file names inside build workspaces, so they are
/// restricted to `[A-Za-z0-9_.-]` and may not be `.` or `..`.
pub fn is_valid_artifact_name(name: &str) -> bool {
    ARTIFACT_NAME.is_match(name) && name != "." && name != ".."
}

/// Errors raised by the artifact store
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("artifact '{0}' not found")]
    NotFound(String),

    #[error("artifact '{0}' was already written in this run")]
    Conflict(String),
}

/// Content of an artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Opaque bytes (source snapshots, build outputs)
    Bytes(Vec<u8>),
    /// Structured document (deployable-unit templates)
    Document(serde_json::Value),
}

impl Payload {
    /// Bytes the digest is computed over
    ///
    /// Documents hash over their JSON encoding; object keys are sorted so
    /// the encoding is canonical.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        match self {
            Payload::Bytes(bytes) => bytes.clone(),
            Payload::Document(value) => serde_json::to_vec(value).unwrap_or_default(),
        }
    }

    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(self.canonical_bytes()))
    }

    pub fn len(&self) -> usize {
        match self {
            Payload::Bytes(bytes) => bytes.len(),
            Payload::Document(_) => self.canonical_bytes().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(bytes)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Bytes(text.as_bytes().to_vec())
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Document(value)
    }
}

/// Reference to an artifact written in a run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Artifact name, unique within the run
    pub name: String,

    /// Hex-encoded sha-256 of the payload
    pub digest: String,

    /// Payload size in bytes
    pub size: usize,
}

/// A stored artifact
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub reference: ArtifactRef,
    pub payload: Payload,
}

impl Artifact {
    pub fn name(&self) -> &str {
        &self.reference.name
    }
}

/// Per-run artifact store
#[derive(Debug, Clone, Default)]
pub struct ArtifactStore {
    /// Payloads keyed by digest
    blobs: HashMap<String, Arc<Artifact>>,

    /// Name bindings in write order
    names: Vec<ArtifactRef>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a named payload
    ///
    /// Fails with [`StoreError::Conflict`] if the name is already bound.
    pub fn put(&mut self, name: &str, payload: Payload) -> Result<ArtifactRef, StoreError> {
        if self.names.iter().any(|r| r.name == name) {
            return Err(StoreError::Conflict(name.to_string()));
        }

        let reference = ArtifactRef {
            name: name.to_string(),
            digest: payload.digest(),
            size: payload.len(),
        };

        self.blobs.insert(
            Self::blob_key(&reference),
            Arc::new(Artifact {
                reference: reference.clone(),
                payload,
            }),
        );
        self.names.push(reference.clone());

        Ok(reference)
    }

    /// Read back the payload behind a reference
    pub fn get(&self, reference: &ArtifactRef) -> Result<&Payload, StoreError> {
        self.blobs
            .get(&Self::blob_key(reference))
            .map(|artifact| &artifact.payload)
            .ok_or_else(|| StoreError::NotFound(reference.name.clone()))
    }

    /// Look up an artifact by name
    pub fn get_by_name(&self, name: &str) -> Result<Arc<Artifact>, StoreError> {
        self.names
            .iter()
            .find(|r| r.name == name)
            .and_then(|r| self.blobs.get(&Self::blob_key(r)))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|r| r.name == name)
    }

    /// All references, in write order
    pub fn references(&self) -> &[ArtifactRef] {
        &self.names
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(|r| r.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Release every artifact of the run
    pub fn discard(&mut self) {
        self.blobs.clear();
        self.names.clear();
    }

    // Two names may hold identical content, so blobs are keyed per binding.
    fn blob_key(reference: &ArtifactRef) -> String {
        format!("{}@{}", reference.name, reference.digest)
    }
}
