//! Classification orchestrator
//!
//! Facade for the transport layer: submits a job, suspends until it
//! finishes, and turns the outcome into a typed response or a [`Failure`].
//! This is the only place internal errors are translated for callers; the
//! detail behind a failure goes to the log, never into the returned value.
//!
//! Author: hephaex@gmail.com

use imgsim_core::{
    Ack, ClassificationRequest, ClassificationResponse, ClassifyRequest, ExtractRequest, Failure,
    FailureKind, ImagePayload, ImgsimError, JobId, JobOutput, JobStatus, RankedResult,
};
use std::sync::Arc;
use std::time::Duration;

use crate::dispatcher::Dispatcher;

/// Caller-facing result type
pub type Outcome<T> = std::result::Result<T, Failure>;

/// Runs requests through the dispatcher and waits for their outcome
#[derive(Clone)]
pub struct ClassificationOrchestrator {
    dispatcher: Arc<Dispatcher>,
    deadline: Option<Duration>,
}

impl ClassificationOrchestrator {
    /// Create an orchestrator; `deadline` bounds every wait when set
    pub fn new(dispatcher: Arc<Dispatcher>, deadline: Option<Duration>) -> Self {
        Self {
            dispatcher,
            deadline,
        }
    }

    /// Same orchestrator with a different wait deadline
    pub fn with_deadline(&self, deadline: Option<Duration>) -> Self {
        Self {
            dispatcher: Arc::clone(&self.dispatcher),
            deadline,
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Register `image` as a reference image of `name`
    pub async fn run_extraction(&self, image: ImagePayload, name: &str) -> Outcome<Ack> {
        let request = ClassificationRequest::Extract(ExtractRequest {
            image,
            owner_name: name.to_string(),
        });
        match self.handle(request).await? {
            ClassificationResponse::Extracted(ack) => Ok(ack),
            ClassificationResponse::Ranked(_) => Err(Failure::new(FailureKind::Internal)),
        }
    }

    /// Rank registered items by similarity to `image`
    ///
    /// An empty store yields an empty result rather than a failure.
    pub async fn run_classification(&self, image: ImagePayload, n: usize) -> Outcome<RankedResult> {
        let request = ClassificationRequest::Classify(ClassifyRequest { image, n });
        match self.handle(request).await? {
            ClassificationResponse::Ranked(ranked) => Ok(ranked),
            ClassificationResponse::Extracted(_) => Err(Failure::new(FailureKind::Internal)),
        }
    }

    /// Run any request to completion
    pub async fn handle(&self, request: ClassificationRequest) -> Outcome<ClassificationResponse> {
        let kind = request.kind();
        let handle = self
            .dispatcher
            .submit(request)
            .await
            .map_err(|e| translate(&e, None))?;
        tracing::debug!("Waiting for {kind} job {}", handle.id);
        self.collect(handle.id).await
    }

    /// Wait again for a job whose earlier wait timed out
    pub async fn resume(&self, id: JobId) -> Outcome<ClassificationResponse> {
        self.collect(id).await
    }

    /// Current status of a submitted job
    pub async fn status(&self, id: JobId) -> Outcome<JobStatus> {
        self.dispatcher
            .status(id)
            .await
            .map_err(|e| translate(&e, Some(id)))
    }

    async fn collect(&self, id: JobId) -> Outcome<ClassificationResponse> {
        // On timeout the job stays registered for a later check
        self.dispatcher
            .wait(id, self.deadline)
            .await
            .map_err(|e| translate(&e, Some(id)))?;

        match self.dispatcher.take_result(id).await {
            Ok(JobOutput::Extracted {
                embedding_id,
                owner_name,
            }) => Ok(ClassificationResponse::Extracted(Ack {
                job_id: id,
                embedding_id,
                owner_name,
            })),
            Ok(JobOutput::Ranked(ranked)) => Ok(ClassificationResponse::Ranked(ranked)),
            Err(ImgsimError::JobFailed(cause)) if cause.kind == FailureKind::EmptyStore => {
                tracing::debug!("Job {id} ranked an empty store");
                Ok(ClassificationResponse::Ranked(RankedResult::default()))
            }
            Err(e) => Err(translate(&e, Some(id))),
        }
    }
}

/// Log the internal detail and keep only the kind for the caller
fn translate(err: &ImgsimError, job_id: Option<JobId>) -> Failure {
    let failure = Failure::from(err);
    let failure = match job_id.or(failure.job_id) {
        Some(id) => failure.with_job(id),
        None => failure,
    };

    if failure.kind == FailureKind::Internal {
        tracing::error!("Request failed: {err}");
    } else {
        tracing::warn!("Request failed ({:?}): {err}", failure.kind);
    }
    failure
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::JobExecutor;
    use async_trait::async_trait;
    use imgsim_core::{DispatcherConfig, EmbeddingId, RankedEntry, Result};
    use tokio::sync::Semaphore;

    /// Answers with canned outcomes selected by the request
    struct CannedExecutor {
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl JobExecutor for CannedExecutor {
        async fn execute(&self, request: ClassificationRequest) -> Result<JobOutput> {
            match request {
                ClassificationRequest::Extract(req) => match req.owner_name.as_str() {
                    "broken" => Err(ImgsimError::InvalidImage(
                        "Unrecognized image format at /tmp/secret.png".into(),
                    )),
                    "slow" => {
                        let _permit = self
                            .gate
                            .acquire()
                            .await
                            .map_err(|e| anyhow::anyhow!(e))?;
                        Ok(JobOutput::Extracted {
                            embedding_id: EmbeddingId(2),
                            owner_name: req.owner_name,
                        })
                    }
                    _ => Ok(JobOutput::Extracted {
                        embedding_id: EmbeddingId(1),
                        owner_name: req.owner_name,
                    }),
                },
                ClassificationRequest::Classify(req) if req.n == 0 => {
                    Err(ImgsimError::EmptyStore)
                }
                ClassificationRequest::Classify(_) => {
                    Ok(JobOutput::Ranked(RankedResult::new(vec![RankedEntry {
                        name: "cola".into(),
                        score: 0.9,
                    }])))
                }
            }
        }
    }

    fn orchestrator(deadline: Option<Duration>) -> (ClassificationOrchestrator, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let config = DispatcherConfig {
            workers: 2,
            queue_capacity: 8,
            retention_secs: 60,
            poll_initial_ms: 1,
            poll_max_ms: 10,
            job_timeout_secs: None,
        };
        let dispatcher = Dispatcher::start(
            &config,
            Arc::new(CannedExecutor {
                gate: Arc::clone(&gate),
            }),
        );
        (
            ClassificationOrchestrator::new(Arc::new(dispatcher), deadline),
            gate,
        )
    }

    fn image() -> ImagePayload {
        ImagePayload::bytes(vec![0u8; 4])
    }

    #[tokio::test]
    async fn test_extraction_ack() {
        let (orchestrator, _gate) = orchestrator(None);
        let ack = orchestrator.run_extraction(image(), "cola").await.unwrap();
        assert_eq!(ack.owner_name, "cola");
        assert_eq!(ack.embedding_id, EmbeddingId(1));

        // The result was consumed
        assert_eq!(
            orchestrator.status(ack.job_id).await.unwrap_err().kind,
            FailureKind::JobNotFound
        );
    }

    #[tokio::test]
    async fn test_classification_result() {
        let (orchestrator, _gate) = orchestrator(None);
        let ranked = orchestrator.run_classification(image(), 3).await.unwrap();
        assert_eq!(ranked.names(), vec!["cola"]);
    }

    #[tokio::test]
    async fn test_empty_store_is_empty_result() {
        let (orchestrator, _gate) = orchestrator(None);
        let ranked = orchestrator.run_classification(image(), 0).await.unwrap();
        assert!(ranked.is_empty());
    }

    #[tokio::test]
    async fn test_failure_hides_detail() {
        let (orchestrator, _gate) = orchestrator(None);
        let failure = orchestrator
            .run_extraction(image(), "broken")
            .await
            .unwrap_err();

        assert_eq!(failure.kind, FailureKind::InvalidImage);
        assert!(failure.job_id.is_some());
        assert!(!failure.to_string().contains("secret"));
    }

    #[tokio::test]
    async fn test_timeout_then_resume() {
        let (orchestrator, gate) = orchestrator(Some(Duration::from_millis(30)));

        let failure = orchestrator
            .run_extraction(image(), "slow")
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Timeout);
        assert!(failure.kind.is_retryable());
        let id = failure.job_id.unwrap();

        gate.add_permits(1);
        let response = orchestrator.with_deadline(None).resume(id).await.unwrap();
        assert!(matches!(
            response,
            ClassificationResponse::Extracted(Ack { job_id, .. }) if job_id == id
        ));
    }

    #[tokio::test]
    async fn test_tagged_request() {
        let (orchestrator, _gate) = orchestrator(None);
        let request: ClassificationRequest = serde_json::from_value(serde_json::json!({
            "type": "classify",
            "image": { "bytes": [1, 2, 3] },
            "n": 5
        }))
        .unwrap();

        let response = orchestrator.handle(request).await.unwrap();
        assert!(matches!(response, ClassificationResponse::Ranked(r) if r.len() == 1));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_requests() {
        let (orchestrator, _gate) = orchestrator(None);
        orchestrator.dispatcher().shutdown().await;

        let failure = orchestrator
            .run_classification(image(), 1)
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::ShuttingDown);
        assert!(failure.job_id.is_none());
    }
}
