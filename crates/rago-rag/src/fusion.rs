//! Hybrid score fusion
//!
//! Each side is normalized within its own candidate set, then combined as
//! `vector_weight * v + keyword_weight * k`. A chunk present on one side only
//! contributes 0 for the other.

use rago_core::{Component, RagoError, RagoResult, SearchResult};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::store::ChunkCandidate;

const WEIGHT_TOLERANCE: f32 = 1e-6;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionMethod {
    /// Min-max scaling; a constant set scales to 1.0
    #[default]
    MinMax,
    /// `(k + 1) / (k + rank)` with 1-based rank
    ReciprocalRank,
}

pub fn check_weights(vector_weight: f32, keyword_weight: f32) -> RagoResult<()> {
    let in_range = |w: f32| (0.0..=1.0).contains(&w);
    if !in_range(vector_weight)
        || !in_range(keyword_weight)
        || (vector_weight + keyword_weight - 1.0).abs() > WEIGHT_TOLERANCE
    {
        return Err(RagoError::bad_request(format!(
            "vector_weight ({}) and keyword_weight ({}) must be in [0, 1] and sum to 1.0",
            vector_weight, keyword_weight
        ))
        .at(Component::Rag, "hybrid_search"));
    }
    Ok(())
}

/// Normalized scores keyed by chunk id; input must be sorted best first
fn normalize(candidates: &[ChunkCandidate], method: FusionMethod, k: f32) -> HashMap<String, f32> {
    match method {
        FusionMethod::MinMax => {
            let (min, max) = candidates
                .iter()
                .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), c| {
                    (lo.min(c.score), hi.max(c.score))
                });
            let range = max - min;
            candidates
                .iter()
                .map(|c| {
                    let norm = if range > f32::EPSILON {
                        (c.score - min) / range
                    } else {
                        1.0
                    };
                    (c.chunk_id.clone(), norm.clamp(0.0, 1.0))
                })
                .collect()
        }
        FusionMethod::ReciprocalRank => candidates
            .iter()
            .enumerate()
            .map(|(i, c)| (c.chunk_id.clone(), (k + 1.0) / (k + (i + 1) as f32)))
            .collect(),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FusionParams {
    pub method: FusionMethod,
    pub vector_weight: f32,
    pub keyword_weight: f32,
    pub rrf_k: f32,
}

/// Fuses both candidate lists and returns the best `limit` results
pub fn fuse(
    vector: &[ChunkCandidate],
    keyword: &[ChunkCandidate],
    params: FusionParams,
    limit: usize,
) -> Vec<SearchResult> {
    let k = params.rrf_k.max(0.0);
    let v_norm = normalize(vector, params.method, k);
    let k_norm = normalize(keyword, params.method, k);

    let mut merged: HashMap<&str, &ChunkCandidate> = HashMap::new();
    for c in vector.iter().chain(keyword.iter()) {
        merged.entry(c.chunk_id.as_str()).or_insert(c);
    }

    let mut results: Vec<SearchResult> = merged
        .into_values()
        .map(|c| {
            let v = v_norm.get(&c.chunk_id).copied().unwrap_or(0.0);
            let kw = k_norm.get(&c.chunk_id).copied().unwrap_or(0.0);
            let score = (params.vector_weight * v + params.keyword_weight * kw).clamp(0.0, 1.0);
            SearchResult {
                chunk_id: c.chunk_id.clone(),
                document_id: c.document_id.clone(),
                content: c.content.clone(),
                score,
                vector_score: Some(v),
                keyword_score: Some(kw),
                metadata: c.metadata.clone(),
            }
        })
        .collect();

    results.sort_by(compare);
    results.truncate(limit);
    results
}

/// Fused score descending, then vector score descending, then chunk id
fn compare(a: &SearchResult, b: &SearchResult) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| {
            b.vector_score
                .unwrap_or(0.0)
                .partial_cmp(&a.vector_score.unwrap_or(0.0))
                .unwrap_or(Ordering::Equal)
        })
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}
