//! Top-N similarity ranking
//!
//! Scores every stored embedding against a query with cosine similarity and
//! keeps the best N in a bounded heap, so a scan over M embeddings costs
//! O(M log N). Equal scores are ordered by insertion: the embedding added
//! first ranks higher.
//!
//! Author: hephaex@gmail.com

use imgsim_core::{
    Embedding, EmbeddingId, ImgsimError, RankedEntry, RankedResult, RankingPolicy, Result,
};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use crate::EmbeddingStore;

const EPSILON: f32 = 1e-6;

/// Cosine similarity of two equally sized vectors
///
/// Returns 0.0 when either vector has (near) zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na < EPSILON || nb < EPSILON {
        return 0.0;
    }
    let score = dot / (na * nb);
    if score.is_nan() {
        f32::NEG_INFINITY
    } else {
        // Adding +0.0 folds -0.0 into 0.0 so equal scores tie under total_cmp
        score + 0.0
    }
}

/// Ranking order: `Less` means `a` ranks above `b`
fn rank_order(a_score: f32, a_id: EmbeddingId, b_score: f32, b_id: EmbeddingId) -> Ordering {
    b_score.total_cmp(&a_score).then_with(|| a_id.cmp(&b_id))
}

/// Heap element; the greatest candidate is the worst-ranked one
#[derive(Debug)]
struct Candidate {
    score: f32,
    id: EmbeddingId,
    name: String,
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        rank_order(self.score, self.id, other.score, other.id)
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

/// Bounded top-N selection
struct TopN {
    limit: usize,
    heap: BinaryHeap<Candidate>,
}

impl TopN {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            heap: BinaryHeap::with_capacity(limit.saturating_add(1).min(1024)),
        }
    }

    fn offer(&mut self, score: f32, id: EmbeddingId, name: &str) {
        if self.limit == 0 {
            return;
        }
        if self.heap.len() == self.limit {
            let Some(worst) = self.heap.peek() else {
                return;
            };
            if rank_order(score, id, worst.score, worst.id) != Ordering::Less {
                return;
            }
            self.heap.pop();
        }
        self.heap.push(Candidate {
            score,
            id,
            name: name.to_string(),
        });
    }

    fn into_result(self) -> RankedResult {
        RankedResult::new(
            self.heap
                .into_sorted_vec()
                .into_iter()
                .map(|c| RankedEntry {
                    name: c.name,
                    score: c.score,
                })
                .collect(),
        )
    }
}

/// Ranks stored embeddings against a query vector
pub struct SimilarityRanker {
    store: Arc<dyn EmbeddingStore>,
    policy: RankingPolicy,
}

impl SimilarityRanker {
    /// Create a ranker over `store`
    pub fn new(store: Arc<dyn EmbeddingStore>, policy: RankingPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> RankingPolicy {
        self.policy
    }

    /// Return the `n` best matches for `query` under the configured policy
    pub fn rank(&self, query: &[f32], n: usize) -> Result<RankedResult> {
        self.rank_with_policy(query, n, self.policy)
    }

    /// Return the `n` best matches for `query` under an explicit policy
    pub fn rank_with_policy(
        &self,
        query: &[f32],
        n: usize,
        policy: RankingPolicy,
    ) -> Result<RankedResult> {
        let dimension = self.store.dimension();
        if query.len() != dimension {
            return Err(ImgsimError::DimensionMismatch {
                expected: dimension,
                actual: query.len(),
            });
        }
        if query.iter().any(|v| !v.is_finite()) {
            return Err(ImgsimError::InvalidRequest(
                "query vector contains non-finite values".to_string(),
            ));
        }

        let mut scanned = 0usize;
        let mut top = TopN::new(n);

        match policy {
            RankingPolicy::PerEmbedding => {
                self.store.scan(&mut |e: &Embedding| {
                    scanned += 1;
                    top.offer(cosine_similarity(query, &e.vector), e.id, &e.owner_name);
                });
            }
            RankingPolicy::DistinctOwner => {
                let mut best: HashMap<String, (f32, EmbeddingId)> = HashMap::new();
                self.store.scan(&mut |e: &Embedding| {
                    scanned += 1;
                    let score = cosine_similarity(query, &e.vector);
                    match best.get_mut(e.owner_name.as_str()) {
                        Some(current) => {
                            if rank_order(score, e.id, current.0, current.1) == Ordering::Less {
                                *current = (score, e.id);
                            }
                        }
                        None => {
                            best.insert(e.owner_name.clone(), (score, e.id));
                        }
                    }
                });
                for (name, (score, id)) in &best {
                    top.offer(*score, *id, name);
                }
            }
        }

        if scanned == 0 {
            return Err(ImgsimError::EmptyStore);
        }

        let result = top.into_result();
        tracing::debug!(
            "Ranked {} embeddings, returning {} (policy={:?})",
            scanned,
            result.len(),
            policy
        );
        Ok(result)
    }
}

// ============================================================================
// Tests
// ============================================================================
