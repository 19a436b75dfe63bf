//! Post-retrieval optimization of scored hits.
//!
//! Three stages, always in this order:
//! 1. Relevance cutoff: hits scoring below the threshold are dropped.
//!    The threshold is applied exactly once, before compression, so a
//!    chunk whose compressed form would score differently is never
//!    re-judged.
//! 2. Contextual compression via a [`Compressor`].
//! 3. Lost-in-the-middle reordering: long-context models attend most
//!    to the ends of their input, so the best chunks go to the edges
//!    and the weakest land in the middle.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Result;

use crate::compress::Compressor;
use crate::models::{Chunk, ScoredChunk};

/// Default relevance cutoff applied before compression.
pub const DEFAULT_MIN_SCORE: f64 = 0.6;

pub struct ResultOptimizer {
    compressor: Arc<dyn Compressor>,
    min_score: f64,
}

impl ResultOptimizer {
    pub fn new(compressor: Arc<dyn Compressor>, min_score: f64) -> Self {
        Self {
            compressor,
            min_score,
        }
    }

    /// Filter, compress, and reorder retrieved hits. Returns an empty
    /// vec when nothing clears the cutoff.
    pub async fn optimize(&self, hits: Vec<ScoredChunk>, query: &str) -> Result<Vec<Chunk>> {
        let mut kept: Vec<ScoredChunk> = hits
            .into_iter()
            .filter(|hit| hit.score >= self.min_score)
            .collect();

        if kept.is_empty() {
            return Ok(Vec::new());
        }

        // Compression and reordering both assume most-relevant-first.
        kept.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let chunks: Vec<Chunk> = kept.into_iter().map(|hit| hit.chunk).collect();
        let compressed = self.compressor.compress(chunks, query).await?;

        Ok(reorder_lost_in_the_middle(compressed))
    }
}

/// Interleave chunks so the most relevant sit at both ends of the
/// sequence and the least relevant in the middle.
///
/// Input is ordered most-relevant-first; for relevance ranks
/// `[1, 2, 3, 4, 5]` the output order is `[1, 3, 5, 4, 2]`.
pub fn reorder_lost_in_the_middle(chunks: Vec<Chunk>) -> Vec<Chunk> {
    let mut reordered = VecDeque::with_capacity(chunks.len());
    for (i, chunk) in chunks.into_iter().rev().enumerate() {
        if i % 2 == 1 {
            reordered.push_back(chunk);
        } else {
            reordered.push_front(chunk);
        }
    }
    reordered.into()
}
