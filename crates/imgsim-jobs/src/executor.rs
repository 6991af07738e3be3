//! Job execution
//!
//! A [`JobExecutor`] performs the work behind one request. The dispatcher
//! owns scheduling and status; executors only turn a request into an
//! output or an error.

use async_trait::async_trait;
use imgsim_core::{ClassificationRequest, ImgsimError, JobOutput, Result};
use imgsim_vector::{FeatureExtractor, SimilarityRanker};
use std::sync::Arc;

/// Trait for the work performed by dispatcher workers
#[async_trait]
pub trait JobExecutor: Send + Sync + 'static {
    /// Run one request to completion
    async fn execute(&self, request: ClassificationRequest) -> Result<JobOutput>;
}

/// Executes extraction and classification against the vector pipeline
pub struct PipelineExecutor {
    extractor: FeatureExtractor,
    ranker: Arc<SimilarityRanker>,
}

impl PipelineExecutor {
    pub fn new(extractor: FeatureExtractor, ranker: Arc<SimilarityRanker>) -> Self {
        Self { extractor, ranker }
    }
}

#[async_trait]
impl JobExecutor for PipelineExecutor {
    async fn execute(&self, request: ClassificationRequest) -> Result<JobOutput> {
        match request {
            ClassificationRequest::Extract(req) => {
                let embedding_id = self.extractor.extract(req.image, &req.owner_name).await?;
                Ok(JobOutput::Extracted {
                    embedding_id,
                    owner_name: req.owner_name,
                })
            }
            ClassificationRequest::Classify(req) => {
                let query = self.extractor.embed_query(req.image).await?;
                let ranker = Arc::clone(&self.ranker);
                let n = req.n;

                // Scoring touches every stored vector
                let ranked = tokio::task::spawn_blocking(move || ranker.rank(&query, n))
                    .await
                    .map_err(|e| ImgsimError::Other(anyhow::anyhow!("ranking task failed: {e}")))??;
                Ok(JobOutput::Ranked(ranked))
            }
        }
    }
}
