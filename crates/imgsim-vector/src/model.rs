//! Model client for generating image feature vectors
//!
//! Talks to a TensorFlow Serving style REST endpoint that accepts base64
//! encoded images and answers with one feature vector per instance.
//!
//! Author: hephaex@gmail.com

use async_trait::async_trait;
use imgsim_core::{ImgsimError, ModelConfig, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::payload::encode_base64;

// ============================================================================
// Model Trait
// ============================================================================

/// Trait for feature vector generation
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Generate a feature vector for one encoded image
    async fn embed_image(&self, image: &[u8]) -> Result<Vec<f32>>;

    /// Generate feature vectors for several encoded images
    async fn embed_batch(&self, images: &[Vec<u8>]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(images.len());
        for image in images {
            results.push(self.embed_image(image).await?);
        }
        Ok(results)
    }

    /// Length of the vectors this model produces
    fn dimension(&self) -> usize;
}

// ============================================================================
// TensorFlow Serving Client
// ============================================================================

/// REST client for a TensorFlow Serving `:predict` endpoint
pub struct TfServingClient {
    client: Client,
    predict_url: String,
    dimension: usize,
}

#[derive(Debug, Serialize)]
struct PredictRequest {
    instances: Vec<PredictInstance>,
}

#[derive(Debug, Serialize)]
struct PredictInstance {
    b64: String,
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    predictions: Vec<Vec<f32>>,
}

impl TfServingClient {
    /// Create a new client for `predict_url`
    pub fn new(
        predict_url: impl Into<String>,
        dimension: usize,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ImgsimError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            predict_url: predict_url.into(),
            dimension,
        })
    }

    /// Create from config
    pub fn from_config(config: &ModelConfig) -> Result<Self> {
        Self::new(
            config.predict_url(),
            config.dimension,
            Duration::from_secs(config.timeout_secs),
        )
    }
}

#[async_trait]
impl ModelClient for TfServingClient {
    async fn embed_image(&self, image: &[u8]) -> Result<Vec<f32>> {
        let results = self.embed_batch(&[image.to_vec()]).await?;
        results
            .into_iter()
            .next()
            .ok_or_else(|| ImgsimError::ModelUnavailable("No prediction returned".to_string()))
    }

    async fn embed_batch(&self, images: &[Vec<u8>]) -> Result<Vec<Vec<f32>>> {
        if images.is_empty() {
            return Ok(Vec::new());
        }

        let request = PredictRequest {
            instances: images
                .iter()
                .map(|image| PredictInstance {
                    b64: encode_base64(image),
                })
                .collect(),
        };

        let response = self
            .client
            .post(&self.predict_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ImgsimError::ModelUnavailable(format!("Predict request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ImgsimError::ModelUnavailable(format!(
                "Model endpoint returned {status}: {error_text}"
            )));
        }

        let result: PredictResponse = response.json().await.map_err(|e| {
            ImgsimError::ModelUnavailable(format!("Failed to parse predict response: {e}"))
        })?;

        check_predictions(result.predictions, images.len(), self.dimension)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Verify the shape of a predict response
fn check_predictions(
    predictions: Vec<Vec<f32>>,
    expected_count: usize,
    dimension: usize,
) -> Result<Vec<Vec<f32>>> {
    if predictions.len() != expected_count {
        return Err(ImgsimError::ModelUnavailable(format!(
            "Expected {expected_count} predictions, got {}",
            predictions.len()
        )));
    }
    for vector in &predictions {
        if vector.len() != dimension {
            return Err(ImgsimError::ModelUnavailable(format!(
                "Expected {dimension}-dimensional features, got {}",
                vector.len()
            )));
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(ImgsimError::ModelUnavailable(
                "Prediction contains non-finite values".to_string(),
            ));
        }
    }
    Ok(predictions)
}

// ============================================================================
// Factory function
// ============================================================================

/// Create a model client from config
pub fn create_model_client(config: &ModelConfig) -> Result<Arc<dyn ModelClient>> {
    Ok(Arc::new(TfServingClient::from_config(config)?))
}

// ============================================================================
// Tests
// ============================================================================
