//! Repair requests and their augmented copies.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length of a derived request id, in hex characters.
pub const REQUEST_ID_LEN: usize = 6;

/// One problem to repair. Immutable once built; augmentation yields a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairRequest {
    id: String,
    repository_ref: String,
    problem_text: String,
    context_files: BTreeMap<String, String>,
    metadata: BTreeMap<String, String>,
}

impl RepairRequest {
    /// Build a request. A missing or blank id is derived from the problem text.
    pub fn new(
        id: Option<String>,
        repository_ref: impl Into<String>,
        problem_text: impl Into<String>,
    ) -> Self {
        let problem_text = problem_text.into();
        let id = id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| derive_request_id(&problem_text));
        Self {
            id,
            repository_ref: repository_ref.into(),
            problem_text,
            context_files: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_context_file(mut self, name: impl Into<String>, content: impl Into<String>) -> Self {
        self.context_files.insert(name.into(), content.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn repository_ref(&self) -> &str {
        &self.repository_ref
    }

    pub fn problem_text(&self) -> &str {
        &self.problem_text
    }

    pub fn context_files(&self) -> &BTreeMap<String, String> {
        &self.context_files
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Derived copy with a replaced problem text and extra context files.
    ///
    /// The id, repository and metadata carry over; existing context files are kept
    /// unless `extra_files` overrides the same name.
    pub fn augmented(
        &self,
        problem_text: impl Into<String>,
        extra_files: impl IntoIterator<Item = (String, String)>,
    ) -> RepairRequest {
        let mut derived = self.clone();
        derived.problem_text = problem_text.into();
        derived.context_files.extend(extra_files);
        derived
    }
}

/// First six hex characters of the SHA-256 of `text`.
pub fn derive_request_id(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    let mut id = hex::encode(digest);
    id.truncate(REQUEST_ID_LEN);
    id
}
