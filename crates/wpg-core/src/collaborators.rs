use crate::dataset_contracts::{Record, RecordId, Snapshot};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderFailureKind {
    Timeout,
    Quota,
    Auth,
    Network,
    InvalidOutput,
    Other,
}

impl ProviderFailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Quota => "quota",
            Self::Auth => "auth",
            Self::Network => "network",
            Self::InvalidOutput => "invalid_output",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ProviderFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Prompt or image generation failed. Never leaves local state modified.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("provider {kind}: {message}")]
pub struct ProviderError {
    pub kind: ProviderFailureKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RemoteFailureKind {
    Auth,
    Network,
    Timeout,
    NotFound,
    Conflict,
    Corrupt,
    Io,
}

impl RemoteFailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Corrupt => "corrupt",
            Self::Io => "io",
        }
    }
}

impl fmt::Display for RemoteFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("remote {kind}: {message}")]
pub struct RemoteError {
    pub kind: RemoteFailureKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

pub trait PromptGenerator {
    /// Up to `count` distinct prompts for `topic`. Returning fewer is allowed.
    fn generate(&self, topic: &str, count: usize) -> Result<Vec<String>, ProviderError>;
}

pub trait ImageFetcher {
    /// Must be a pure function of its inputs for content dedup to hold.
    fn fetch(
        &self,
        prompt: &str,
        width: u32,
        height: u32,
        seed: u64,
    ) -> Result<Vec<u8>, ProviderError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageUpload {
    pub record_id: RecordId,
    pub image_path: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitResult {
    pub revision: String,
    pub records: usize,
    pub uploaded_images: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Committed(CommitResult),
    /// The remote moved past `parent_revision` since the pull.
    ConflictHint {
        remote_revision: Option<String>,
        reason: String,
    },
}

pub trait RemoteMirror {
    /// Current remote state. An absent dataset is an empty snapshot, not an error.
    fn pull(&self, dataset_id: &str) -> Result<Snapshot, RemoteError>;

    fn fetch_image(&self, dataset_id: &str, record: &Record) -> Result<Vec<u8>, RemoteError>;

    fn push(
        &self,
        dataset_id: &str,
        snapshot: &Snapshot,
        parent_revision: Option<&str>,
        uploads: &[ImageUpload],
    ) -> Result<PushOutcome, RemoteError>;
}

impl<T: PromptGenerator + ?Sized> PromptGenerator for &T {
    fn generate(&self, topic: &str, count: usize) -> Result<Vec<String>, ProviderError> {
        (**self).generate(topic, count)
    }
}

impl<T: ImageFetcher + ?Sized> ImageFetcher for &T {
    fn fetch(
        &self,
        prompt: &str,
        width: u32,
        height: u32,
        seed: u64,
    ) -> Result<Vec<u8>, ProviderError> {
        (**self).fetch(prompt, width, height, seed)
    }
}

impl<T: RemoteMirror + ?Sized> RemoteMirror for &T {
    fn pull(&self, dataset_id: &str) -> Result<Snapshot, RemoteError> {
        (**self).pull(dataset_id)
    }

    fn fetch_image(&self, dataset_id: &str, record: &Record) -> Result<Vec<u8>, RemoteError> {
        (**self).fetch_image(dataset_id, record)
    }

    fn push(
        &self,
        dataset_id: &str,
        snapshot: &Snapshot,
        parent_revision: Option<&str>,
        uploads: &[ImageUpload],
    ) -> Result<PushOutcome, RemoteError> {
        (**self).push(dataset_id, snapshot, parent_revision, uploads)
    }
}

impl<T: PromptGenerator + ?Sized> PromptGenerator for Box<T> {
    fn generate(&self, topic: &str, count: usize) -> Result<Vec<String>, ProviderError> {
        (**self).generate(topic, count)
    }
}
