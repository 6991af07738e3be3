//! Service lifecycle
//!
//! Builds the pipeline from configuration and tears it down in order:
//! stop accepting jobs, drain the queue, then persist the store.

use imgsim_core::{AppConfig, ImgsimError, Result};
use imgsim_vector::{
    EmbeddingStore, FeatureExtractor, MemoryStore, ModelClient, SimilarityRanker,
};
use std::sync::Arc;

use crate::dispatcher::Dispatcher;
use crate::executor::PipelineExecutor;
use crate::orchestrator::ClassificationOrchestrator;

/// A running classification pipeline
pub struct ImgsimService {
    config: AppConfig,
    store: Arc<MemoryStore>,
    dispatcher: Arc<Dispatcher>,
    orchestrator: ClassificationOrchestrator,
}

impl ImgsimService {
    /// Validate `config`, open the store, and start the worker pool
    pub fn start(config: AppConfig, model: Arc<dyn ModelClient>) -> Result<Self> {
        config.validate()?;

        let dimension = config.model.dimension;
        let store = Arc::new(match &config.store.snapshot_path {
            Some(path) => MemoryStore::open(path, dimension)?,
            None => MemoryStore::new(dimension),
        });

        let extractor = FeatureExtractor::new(model, store.clone())?;
        let ranker = Arc::new(SimilarityRanker::new(store.clone(), config.ranking.policy));
        let executor = Arc::new(PipelineExecutor::new(extractor, ranker));

        let dispatcher = Arc::new(Dispatcher::start(&config.dispatcher, executor));
        let orchestrator = ClassificationOrchestrator::new(
            Arc::clone(&dispatcher),
            config.dispatcher.job_timeout(),
        );

        tracing::info!(
            "imgsim service started: {} embeddings, dimension {}, policy {:?}",
            store.len(),
            dimension,
            config.ranking.policy
        );

        Ok(Self {
            config,
            store,
            dispatcher,
            orchestrator,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &ClassificationOrchestrator {
        &self.orchestrator
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Remove an item's embeddings; called when the item itself is deleted
    pub fn delete_item(&self, name: &str) -> usize {
        self.store.delete_all(name)
    }

    /// Drain outstanding jobs and write the snapshot, if one is configured
    pub async fn shutdown(&self) -> Result<()> {
        self.dispatcher.shutdown().await;

        if let Some(path) = &self.config.store.snapshot_path {
            let store = Arc::clone(&self.store);
            let path = path.clone();
            tokio::task::spawn_blocking(move || store.save_snapshot(path))
                .await
                .map_err(|e| ImgsimError::Storage(format!("snapshot task failed: {e}")))??;
        }

        tracing::info!("imgsim service stopped");
        Ok(())
    }
}
