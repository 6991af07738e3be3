//! imgsim Core - Domain models, error taxonomy, and shared types
//!
//! This crate defines the core abstractions used throughout imgsim:
//! - Embeddings and ranked similarity results
//! - Job identity, kinds, and status
//! - The tagged request/response variants accepted by the orchestrator
//! - Internal error types and the caller-facing failure taxonomy
//! - Configuration management

pub mod config;

pub use config::{
    AppConfig, ConfigError, DispatcherConfig, LoggingConfig, ModelConfig, RankingConfig,
    RankingPolicy, StoreConfig,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Error Types
// ============================================================================

/// Internal error type for imgsim operations
///
/// Carries detail meant for logs. Callers outside the pipeline only ever see
/// a [`Failure`], produced by [`ImgsimError::kind`].
#[derive(Error, Debug)]
pub enum ImgsimError {
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Embedding store is empty")]
    EmptyStore,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Job not finished yet: {0}")]
    JobNotTerminal(JobId),

    #[error("Timed out waiting for job {0}")]
    Timeout(JobId),

    #[error("Job was cancelled: {0}")]
    Cancelled(JobId),

    #[error("Job queue is full")]
    QueueFull,

    #[error("Dispatcher is shutting down")]
    ShuttingDown,

    #[error("Job failed: {0}")]
    JobFailed(JobFailure),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ImgsimError>;

impl ImgsimError {
    /// Classify this error into the caller-facing taxonomy
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::InvalidImage(_) => FailureKind::InvalidImage,
            Self::ModelUnavailable(_) => FailureKind::ModelUnavailable,
            Self::DimensionMismatch { .. } => FailureKind::DimensionMismatch,
            Self::EmptyStore => FailureKind::EmptyStore,
            Self::InvalidRequest(_) => FailureKind::InvalidRequest,
            Self::JobNotFound(_) => FailureKind::JobNotFound,
            Self::JobNotTerminal(_) => FailureKind::JobNotTerminal,
            Self::Timeout(_) => FailureKind::Timeout,
            Self::Cancelled(_) => FailureKind::Cancelled,
            Self::QueueFull => FailureKind::QueueFull,
            Self::ShuttingDown => FailureKind::ShuttingDown,
            Self::JobFailed(failure) => failure.kind,
            Self::Storage(_) | Self::Config(_) | Self::Other(_) => FailureKind::Internal,
        }
    }

    /// Job id attached to this error, if any
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Self::JobNotFound(id)
            | Self::JobNotTerminal(id)
            | Self::Timeout(id)
            | Self::Cancelled(id) => Some(*id),
            _ => None,
        }
    }
}

/// Caller-facing failure categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Malformed or undecodable image; resubmit a valid one
    InvalidImage,
    /// Model serving endpoint unreachable or misbehaving
    ModelUnavailable,
    /// Vector dimensionality does not match the store
    DimensionMismatch,
    /// Nothing registered yet
    EmptyStore,
    /// Request rejected before any work was queued
    InvalidRequest,
    JobNotFound,
    JobNotTerminal,
    /// Caller deadline exceeded; the job may still be in flight
    Timeout,
    Cancelled,
    /// Dispatcher is saturated
    QueueFull,
    ShuttingDown,
    Internal,
}

impl FailureKind {
    /// Whether resubmitting the same request may succeed
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::ModelUnavailable | Self::Timeout | Self::QueueFull)
    }

    fn message(self) -> &'static str {
        match self {
            Self::InvalidImage => "the image could not be decoded",
            Self::ModelUnavailable => "the feature model is currently unavailable",
            Self::DimensionMismatch => "feature dimensionality does not match the store",
            Self::EmptyStore => "no reference images are registered",
            Self::InvalidRequest => "the request is invalid",
            Self::JobNotFound => "the job is unknown or has expired",
            Self::JobNotTerminal => "the job has not finished yet",
            Self::Timeout => "the job did not finish before the deadline",
            Self::Cancelled => "the job was cancelled",
            Self::QueueFull => "too many jobs are queued",
            Self::ShuttingDown => "the service is shutting down",
            Self::Internal => "an internal error occurred",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

/// Typed, inspectable failure returned to callers
///
/// Its text never contains upstream error detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    /// Job that produced the failure, when one was submitted
    pub job_id: Option<JobId>,
}

impl Failure {
    pub fn new(kind: FailureKind) -> Self {
        Self { kind, job_id: None }
    }

    pub fn with_job(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.job_id {
            Some(id) => write!(f, "{} (job {id})", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for Failure {}

impl From<&ImgsimError> for Failure {
    fn from(err: &ImgsimError) -> Self {
        Self {
            kind: err.kind(),
            job_id: err.job_id(),
        }
    }
}

/// Cause captured inside a failed job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    /// Internal detail, kept for logs
    pub detail: String,
}

impl From<&ImgsimError> for JobFailure {
    fn from(err: &ImgsimError) -> Self {
        Self {
            kind: err.kind(),
            detail: err.to_string(),
        }
    }
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.detail)
    }
}

// ============================================================================
// Embeddings
// ============================================================================

/// Identifier of a stored embedding
///
/// Ids are allocated from a monotonically increasing sequence, so comparing
/// two ids tells which embedding was inserted first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EmbeddingId(pub u64);

impl std::fmt::Display for EmbeddingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A feature vector owned by a named item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub id: EmbeddingId,
    pub owner_name: String,
    pub vector: Vec<f32>,
}

/// One entry of a similarity ranking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedEntry {
    pub name: String,
    pub score: f32,
}

/// Top-N similarity result, best match first
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RankedResult {
    pub entries: Vec<RankedEntry>,
}

impl RankedResult {
    pub fn new(entries: Vec<RankedEntry>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names in rank order
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name == name)
    }
}

// ============================================================================
// Images
// ============================================================================

/// Image as received from a caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImagePayload {
    /// Base64-encoded image, optionally prefixed with a `data:` URL header
    Base64(String),
    /// Raw encoded image bytes
    Bytes(Vec<u8>),
}

impl ImagePayload {
    pub fn base64(data: impl Into<String>) -> Self {
        Self::Base64(data.into())
    }

    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        Self::Bytes(data.into())
    }
}

// ============================================================================
// Jobs
// ============================================================================

/// Opaque job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Kind of work a job performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    ExtractFeatures,
    ClassifySimilar,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ExtractFeatures => write!(f, "extract_features"),
            Self::ClassifySimilar => write!(f, "classify_similar"),
        }
    }
}

/// Observable job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Handle returned on submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: JobId,
    pub kind: JobKind,
}

/// Snapshot of a job for inspection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Requests and Responses
// ============================================================================

/// Register a reference image under an item name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractRequest {
    pub image: ImagePayload,
    pub owner_name: String,
}

/// Find the `n` registered items most similar to an image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifyRequest {
    pub image: ImagePayload,
    pub n: usize,
}

/// Tagged request variant decided at the transport boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClassificationRequest {
    Extract(ExtractRequest),
    Classify(ClassifyRequest),
}

impl ClassificationRequest {
    pub fn kind(&self) -> JobKind {
        match self {
            Self::Extract(_) => JobKind::ExtractFeatures,
            Self::Classify(_) => JobKind::ClassifySimilar,
        }
    }
}

/// Output of a successful job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum JobOutput {
    Extracted {
        embedding_id: EmbeddingId,
        owner_name: String,
    },
    Ranked(RankedResult),
}

/// Acknowledgement of a completed extraction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub job_id: JobId,
    pub embedding_id: EmbeddingId,
    pub owner_name: String,
}

/// Typed response from the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClassificationResponse {
    Extracted(Ack),
    Ranked(RankedResult),
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_mapping() {
        let err = ImgsimError::DimensionMismatch {
            expected: 4,
            actual: 3,
        };
        assert_eq!(err.kind(), FailureKind::DimensionMismatch);
        assert_eq!(ImgsimError::EmptyStore.kind(), FailureKind::EmptyStore);
        assert_eq!(
            ImgsimError::Storage("disk full".into()).kind(),
            FailureKind::Internal
        );
    }

    #[test]
    fn test_job_failed_keeps_inner_kind() {
        let cause = JobFailure::from(&ImgsimError::InvalidImage("bad header".into()));
        let err = ImgsimError::JobFailed(cause);
        assert_eq!(err.kind(), FailureKind::InvalidImage);
    }

    #[test]
    fn test_failure_hides_upstream_detail() {
        let id = JobId::new();
        let err = ImgsimError::ModelUnavailable("connection refused at 10.0.0.7:8501".into());
        let failure = Failure::from(&err).with_job(id);

        let text = failure.to_string();
        assert!(!text.contains("10.0.0.7"));
        assert!(text.contains(&id.to_string()));
        assert!(failure.kind.is_retryable());
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(FailureKind::Timeout.is_retryable());
        assert!(FailureKind::QueueFull.is_retryable());
        assert!(!FailureKind::InvalidImage.is_retryable());
        assert!(!FailureKind::DimensionMismatch.is_retryable());
    }

    #[test]
    fn test_job_status_terminal() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_job_id_roundtrip_from_str() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_request_tagging() {
        let request: ClassificationRequest = serde_json::from_value(serde_json::json!({
            "type": "classify",
            "image": { "base64": "aGVsbG8=" },
            "n": 3
        }))
        .unwrap();

        assert_eq!(request.kind(), JobKind::ClassifySimilar);
    }

    #[test]
    fn test_ranked_result_helpers() {
        let result = RankedResult::new(vec![
            RankedEntry {
                name: "cola".into(),
                score: 0.9,
            },
            RankedEntry {
                name: "lemonade".into(),
                score: 0.4,
            },
        ]);
        assert_eq!(result.names(), vec!["cola", "lemonade"]);
        assert!(result.contains("cola"));
        assert!(!result.contains("water"));
    }
}
