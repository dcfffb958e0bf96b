//! Greedy, order-sensitive near-duplicate removal over embedding vectors.

use serde::{Deserialize, Serialize};

use crate::core::embeddings::{cosine_similarity, EmbeddingVector};

/// Why a candidate was dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Removal {
    /// Crop index of the removed candidate
    pub index: usize,
    /// Crop index of the kept image it matched best
    pub duplicate_of: usize,
    /// Their cosine similarity
    pub similarity: f32,
}

/// Outcome of one deduplication pass.
///
/// Every input index appears exactly once, either in `kept` or in `removed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupResult {
    /// Surviving crop indices, in input order
    pub kept: Vec<usize>,
    /// Dropped crop indices, in input order, with the match that caused it
    pub removed: Vec<Removal>,
    /// Threshold the pass ran with
    pub similarity_threshold: f32,
    /// `removed / (kept + removed)`, 0 for empty input
    pub deduplication_rate: f64,
}

impl DedupResult {
    /// Number of kept candidates
    pub fn kept_count(&self) -> usize {
        self.kept.len()
    }

    /// Number of removed candidates
    pub fn removed_count(&self) -> usize {
        self.removed.len()
    }

    /// Number of candidates classified
    pub fn total(&self) -> usize {
        self.kept.len() + self.removed.len()
    }
}

/// Keep each vector unless it is more similar than `threshold` to one already kept.
///
/// Earlier vectors win: they become the canonical copy that later near-duplicates
/// are attributed to. When several kept vectors exceed the threshold the best
/// match is recorded; exact ties go to the earliest kept one.
///
/// The kept set grows as the pass advances and each decision depends on every
/// earlier one, so this runs strictly in input order. Cost is O(n²) comparisons.
pub fn deduplicate(vectors: &[EmbeddingVector], threshold: f32) -> DedupResult {
    let mut kept: Vec<&EmbeddingVector> = Vec::new();
    let mut removed = Vec::new();

    for candidate in vectors {
        let mut best: Option<(usize, f32)> = None;
        for k in &kept {
            let similarity = cosine_similarity(&candidate.vector, &k.vector);
            if similarity > threshold && best.map_or(true, |(_, s)| similarity > s) {
                best = Some((k.owner_crop_index, similarity));
            }
        }

        match best {
            Some((duplicate_of, similarity)) => {
                log::debug!(
                    "Crop {} duplicates crop {} (similarity {:.3})",
                    candidate.owner_crop_index,
                    duplicate_of,
                    similarity
                );
                removed.push(Removal {
                    index: candidate.owner_crop_index,
                    duplicate_of,
                    similarity,
                });
            }
            None => kept.push(candidate),
        }
    }

    let kept: Vec<usize> = kept.iter().map(|v| v.owner_crop_index).collect();
    let total = kept.len() + removed.len();
    let deduplication_rate = if total == 0 {
        0.0
    } else {
        removed.len() as f64 / total as f64
    };

    log::info!(
        "Deduplication at {:.3}: {} candidates, kept {}, removed {} ({:.1}%)",
        threshold,
        total,
        kept.len(),
        removed.len(),
        deduplication_rate * 100.0
    );

    DedupResult {
        kept,
        removed,
        similarity_threshold: threshold,
        deduplication_rate,
    }
}
