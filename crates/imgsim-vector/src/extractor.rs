//! Feature extraction
//!
//! Validates an image, obtains its feature vector from the model client,
//! and (for reference images) appends the vector to the embedding store.

use imgsim_core::{EmbeddingId, ImagePayload, ImgsimError, Result};
use std::sync::Arc;

use crate::model::ModelClient;
use crate::payload::{decode_image, ValidatedImage};
use crate::EmbeddingStore;

/// Turns images into stored embeddings
#[derive(Clone)]
pub struct FeatureExtractor {
    model: Arc<dyn ModelClient>,
    store: Arc<dyn EmbeddingStore>,
}

impl FeatureExtractor {
    /// Create an extractor; the model and the store must agree on dimension
    pub fn new(model: Arc<dyn ModelClient>, store: Arc<dyn EmbeddingStore>) -> Result<Self> {
        if model.dimension() != store.dimension() {
            return Err(ImgsimError::DimensionMismatch {
                expected: store.dimension(),
                actual: model.dimension(),
            });
        }
        Ok(Self { model, store })
    }

    pub fn store(&self) -> &Arc<dyn EmbeddingStore> {
        &self.store
    }

    /// Extract features from `image` and store them under `owner_name`
    ///
    /// Each call adds a new embedding, even for an owner that already has
    /// some. Nothing is stored when validation or the model call fails.
    pub async fn extract(&self, image: ImagePayload, owner_name: &str) -> Result<EmbeddingId> {
        if owner_name.trim().is_empty() {
            return Err(ImgsimError::InvalidRequest(
                "owner name must not be empty".to_string(),
            ));
        }

        let vector = self.embed_query(image).await?;
        let id = self.store.add(owner_name, vector)?;
        tracing::info!("Stored embedding {id} for '{owner_name}'");
        Ok(id)
    }

    /// Extract features from `image` without storing them
    pub async fn embed_query(&self, image: ImagePayload) -> Result<Vec<f32>> {
        let image = validate(image).await?;
        tracing::debug!(
            "Embedding {:?} image {}x{}",
            image.format,
            image.width,
            image.height
        );

        let vector = self.model.embed_image(&image.bytes).await?;
        if vector.len() != self.store.dimension() {
            return Err(ImgsimError::ModelUnavailable(format!(
                "Model returned {} features, expected {}",
                vector.len(),
                self.store.dimension()
            )));
        }
        Ok(vector)
    }
}

/// Decode on a blocking thread; full image parsing is CPU bound
async fn validate(image: ImagePayload) -> Result<ValidatedImage> {
    tokio::task::spawn_blocking(move || decode_image(image))
        .await
        .map_err(|e| anyhow::anyhow!("image validation task failed: {e}"))?
}

// ============================================================================
// Tests
// ============================================================================
