//! imgsim Vector - Embedding storage and similarity search
//!
//! Provides the embedding store, the top-N similarity ranker, and the
//! feature extractor that turns images into stored embeddings through an
//! external model serving endpoint.

use imgsim_core::{Embedding, EmbeddingId, Result};

pub mod extractor;
pub mod model;
pub mod payload;
pub mod ranker;
pub mod store;

pub use extractor::FeatureExtractor;
pub use model::{create_model_client, ModelClient, TfServingClient};
pub use payload::{decode_image, ValidatedImage};
pub use ranker::{cosine_similarity, SimilarityRanker};
pub use store::MemoryStore;

/// Trait for embedding storage
///
/// Vectors are grouped by owner name. Mutations for one owner are
/// serialized: a `delete_all` never leaves part of an owner's set behind
/// while an `add` for that owner is in flight.
pub trait EmbeddingStore: Send + Sync {
    /// Dimensionality every stored vector must have
    fn dimension(&self) -> usize;

    /// Append an embedding under `owner_name`
    fn add(&self, owner_name: &str, vector: Vec<f32>) -> Result<EmbeddingId>;

    /// Visit every stored embedding, in no particular order
    fn scan(&self, visit: &mut dyn FnMut(&Embedding));

    /// Embeddings stored under exactly `owner_name`
    fn by_owner(&self, owner_name: &str) -> Vec<Embedding>;

    /// Remove every embedding of `owner_name`, returning how many went away
    fn delete_all(&self, owner_name: &str) -> usize;

    /// Number of stored embeddings
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All embeddings in insertion order
    fn all(&self) -> Vec<Embedding> {
        let mut out = Vec::with_capacity(self.len());
        self.scan(&mut |e: &Embedding| out.push(e.clone()));
        out.sort_by_key(|e| e.id);
        out
    }

    /// Embeddings whose owner name starts with `prefix`, in insertion order
    fn with_prefix(&self, prefix: &str) -> Vec<Embedding> {
        let mut out = Vec::new();
        self.scan(&mut |e: &Embedding| {
            if e.owner_name.starts_with(prefix) {
                out.push(e.clone());
            }
        });
        out.sort_by_key(|e| e.id);
        out
    }
}
