//! In-memory embedding store
//!
//! Embeddings are sharded by owner name in a concurrent map, so adds for
//! different owners proceed independently while every mutation of one
//! owner's set happens under that owner's shard lock. The store can be
//! persisted to and restored from a JSON snapshot.
//!
//! Author: hephaex@gmail.com

use dashmap::DashMap;
use imgsim_core::{Embedding, EmbeddingId, ImgsimError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::EmbeddingStore;

/// Concurrent in-memory embedding store
#[derive(Debug)]
pub struct MemoryStore {
    dimension: usize,
    next_id: AtomicU64,
    owners: DashMap<String, Vec<Embedding>>,
}

/// On-disk snapshot format
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    dimension: usize,
    embeddings: Vec<Embedding>,
}

impl MemoryStore {
    /// Create an empty store for vectors of `dimension` components
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            next_id: AtomicU64::new(0),
            owners: DashMap::new(),
        }
    }

    /// Open a snapshot if it exists, otherwise start empty
    pub fn open(path: impl AsRef<Path>, dimension: usize) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let store = Self::load_snapshot(path)?;
            if store.dimension != dimension {
                return Err(ImgsimError::DimensionMismatch {
                    expected: dimension,
                    actual: store.dimension,
                });
            }
            Ok(store)
        } else {
            tracing::debug!("No snapshot at {}, starting empty", path.display());
            Ok(Self::new(dimension))
        }
    }

    /// Restore a store from a JSON snapshot
    pub fn load_snapshot(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read(path).map_err(|e| {
            ImgsimError::Storage(format!("Failed to read snapshot {}: {e}", path.display()))
        })?;
        let snapshot: Snapshot = serde_json::from_slice(&content).map_err(|e| {
            ImgsimError::Storage(format!("Failed to parse snapshot {}: {e}", path.display()))
        })?;

        let store = Self::new(snapshot.dimension);
        let mut max_id = None;
        for embedding in snapshot.embeddings {
            if embedding.vector.len() != snapshot.dimension {
                return Err(ImgsimError::DimensionMismatch {
                    expected: snapshot.dimension,
                    actual: embedding.vector.len(),
                });
            }
            max_id = max_id.max(Some(embedding.id.0));
            store
                .owners
                .entry(embedding.owner_name.clone())
                .or_default()
                .push(embedding);
        }
        // Keep each owner's list in insertion order regardless of file order
        for mut entry in store.owners.iter_mut() {
            entry.value_mut().sort_by_key(|e| e.id);
        }
        store
            .next_id
            .store(max_id.map_or(0, |id| id + 1), Ordering::SeqCst);

        tracing::info!(
            "Loaded {} embeddings for {} owners from {}",
            store.len(),
            store.owners.len(),
            path.display()
        );
        Ok(store)
    }

    /// Write a JSON snapshot, replacing `path` atomically
    pub fn save_snapshot(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let snapshot = Snapshot {
            dimension: self.dimension,
            embeddings: self.all(),
        };
        let content = serde_json::to_vec(&snapshot)
            .map_err(|e| ImgsimError::Storage(format!("Failed to encode snapshot: {e}")))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                ImgsimError::Storage(format!("Failed to create {}: {e}", parent.display()))
            })?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, content).map_err(|e| {
            ImgsimError::Storage(format!("Failed to write {}: {e}", tmp.display()))
        })?;
        std::fs::rename(&tmp, path).map_err(|e| {
            ImgsimError::Storage(format!("Failed to replace {}: {e}", path.display()))
        })?;

        tracing::debug!(
            "Saved {} embeddings to {}",
            snapshot.embeddings.len(),
            path.display()
        );
        Ok(())
    }

    /// Owner names with their embedding counts, sorted by name
    pub fn owners(&self) -> Vec<(String, usize)> {
        let mut owners: Vec<_> = self
            .owners
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().len()))
            .collect();
        owners.sort();
        owners
    }
}

impl EmbeddingStore for MemoryStore {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn add(&self, owner_name: &str, vector: Vec<f32>) -> Result<EmbeddingId> {
        if owner_name.is_empty() {
            return Err(ImgsimError::InvalidRequest(
                "owner name must not be empty".to_string(),
            ));
        }
        if vector.len() != self.dimension {
            return Err(ImgsimError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(ImgsimError::InvalidRequest(
                "vector contains non-finite values".to_string(),
            ));
        }

        // The shard lock is held for the id allocation and the push, so a
        // concurrent delete_all for this owner sees both or neither.
        let mut entry = self.owners.entry(owner_name.to_string()).or_default();
        let id = EmbeddingId(self.next_id.fetch_add(1, Ordering::SeqCst));
        entry.push(Embedding {
            id,
            owner_name: owner_name.to_string(),
            vector,
        });
        drop(entry);

        tracing::debug!("Added embedding {id} for '{owner_name}'");
        Ok(id)
    }

    fn scan(&self, visit: &mut dyn FnMut(&Embedding)) {
        for entry in self.owners.iter() {
            for embedding in entry.value() {
                visit(embedding);
            }
        }
    }

    fn by_owner(&self, owner_name: &str) -> Vec<Embedding> {
        self.owners
            .get(owner_name)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    fn delete_all(&self, owner_name: &str) -> usize {
        let removed = self
            .owners
            .remove(owner_name)
            .map_or(0, |(_, embeddings)| embeddings.len());
        tracing::debug!("Deleted {removed} embeddings for '{owner_name}'");
        removed
    }

    fn len(&self) -> usize {
        self.owners.iter().map(|entry| entry.value().len()).sum()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_add_and_lookup() {
        let store = MemoryStore::new(2);
        let a = store.add("cola", vec![1.0, 0.0]).unwrap();
        let b = store.add("cola", vec![0.9, 0.1]).unwrap();
        store.add("lemonade", vec![0.0, 1.0]).unwrap();

        assert_ne!(a, b);
        assert!(a < b);
        assert_eq!(store.len(), 3);
        assert_eq!(store.by_owner("cola").len(), 2);
        assert!(store.by_owner("water").is_empty());
    }

    #[test]
    fn test_all_is_insertion_ordered() {
        let store = MemoryStore::new(1);
        for name in ["b", "a", "c", "a"] {
            store.add(name, vec![1.0]).unwrap();
        }

        let owners: Vec<_> = store.all().into_iter().map(|e| e.owner_name).collect();
        assert_eq!(owners, vec!["b", "a", "c", "a"]);
    }

    #[test]
    fn test_rejects_wrong_dimension() {
        let store = MemoryStore::new(3);
        let err = store.add("cola", vec![1.0, 2.0]).unwrap_err();
        assert!(matches!(
            err,
            ImgsimError::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn test_rejects_empty_owner_and_nan() {
        let store = MemoryStore::new(1);
        assert!(store.add("", vec![1.0]).is_err());
        assert!(store.add("cola", vec![f32::NAN]).is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn test_delete_all_is_idempotent() {
        let store = MemoryStore::new(1);
        store.add("cola", vec![1.0]).unwrap();
        store.add("cola", vec![0.5]).unwrap();
        store.add("fanta", vec![0.2]).unwrap();

        assert_eq!(store.delete_all("cola"), 2);
        assert_eq!(store.delete_all("cola"), 0);
        assert_eq!(store.delete_all("never-added"), 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_prefix_lookup() {
        let store = MemoryStore::new(1);
        store.add("soda/cola", vec![1.0]).unwrap();
        store.add("soda/fanta", vec![1.0]).unwrap();
        store.add("juice/apple", vec![1.0]).unwrap();

        let sodas = store.with_prefix("soda/");
        assert_eq!(sodas.len(), 2);
        assert!(sodas.iter().all(|e| e.owner_name.starts_with("soda/")));
    }

    #[test]
    fn test_owners_listing() {
        let store = MemoryStore::new(1);
        store.add("b", vec![1.0]).unwrap();
        store.add("a", vec![1.0]).unwrap();
        store.add("b", vec![1.0]).unwrap();

        assert_eq!(
            store.owners(),
            vec![("a".to_string(), 1), ("b".to_string(), 2)]
        );
    }

    #[test]
    fn test_concurrent_adds_for_different_owners() {
        let store = Arc::new(MemoryStore::new(2));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        store.add(&format!("owner-{t}"), vec![t as f32, i as f32]).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.len(), 800);
        for t in 0..8 {
            assert_eq!(store.by_owner(&format!("owner-{t}")).len(), 100);
        }
        let mut ids: Vec<_> = store.all().into_iter().map(|e| e.id).collect();
        ids.dedup();
        assert_eq!(ids.len(), 800);
    }

    #[test]
    fn test_delete_during_adds_leaves_no_half_state() {
        let store = Arc::new(MemoryStore::new(1));
        let writer = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for _ in 0..500 {
                    store.add("cola", vec![1.0]).unwrap();
                }
            })
        };

        let mut removed = 0;
        while !writer.is_finished() {
            removed += store.delete_all("cola");
        }
        writer.join().unwrap();
        removed += store.delete_all("cola");

        // Every add was either removed by some delete or is still present.
        assert_eq!(removed, 500);
        assert!(store.by_owner("cola").is_empty());
    }

    #[test]
    fn test_snapshot_roundtrip_keeps_order_and_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.json");

        let store = MemoryStore::new(2);
        store.add("cola", vec![1.0, 0.0]).unwrap();
        store.add("fanta", vec![0.0, 1.0]).unwrap();
        store.add("cola", vec![0.5, 0.5]).unwrap();
        store.save_snapshot(&path).unwrap();

        let restored = MemoryStore::open(&path, 2).unwrap();
        assert_eq!(restored.all(), store.all());

        // New ids continue after the restored ones
        let next = restored.add("sprite", vec![0.1, 0.2]).unwrap();
        assert_eq!(next, EmbeddingId(3));
    }

    #[test]
    fn test_open_rejects_dimension_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.json");
        MemoryStore::new(2).save_snapshot(&path).unwrap();

        assert!(matches!(
            MemoryStore::open(&path, 3),
            Err(ImgsimError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_open_missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(dir.path().join("missing.json"), 4).unwrap();
        assert!(store.is_empty());
        assert_eq!(store.dimension(), 4);
    }
}
