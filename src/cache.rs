//! Knowledge Cache (C4): hybrid vector + keyword search over
//! human-approved Q/A pairs, fused with Reciprocal Rank Fusion.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{OrchestratorError, OrchestratorResult};

/// `k` in the RRF formula `score = sum(1 / (k + rank))` (spec.md §4.4).
pub const RRF_K: f64 = 60.0;

/// Fused score at or above this is a cache hit for downstream routing.
pub const CACHE_HIT_THRESHOLD: f64 = 0.7;

const EMBEDDING_TTL_DAYS: i64 = 7;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub human_approved: bool,
    pub approved_by: String,
    pub approval_timestamp: DateTime<Utc>,
    pub category: String,
    pub human_modified: bool,
    pub times_asked: u64,
    pub effectiveness_score: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedEntry {
    pub id: Uuid,
    pub question: String,
    pub answer: String,
    pub question_embedding: Vec<f32>,
    pub answer_embedding: Vec<f32>,
    pub metadata: CacheMetadata,
    /// Fused RRF score attached by `search`; absent on entries read any
    /// other way.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relevance_score: Option<f64>,
}

/// Embeds text into a fixed-dimension vector. The real system would call
/// out to an embeddings model; this is a pluggable seam so tests can run
/// without network access, matching the sandbox/model collaborator
/// pattern elsewhere in this crate.
pub trait Embedder: Send + Sync {
    fn dimension(&self) -> usize;
    fn embed(&self, text: &str) -> Vec<f32>;
}

/// Deterministic hashing embedder: stable across runs, cheap, and good
/// enough to exercise the retrieval pipeline without a real model.
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl Embedder for HashingEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut out = vec![0f32; self.dimension];
        for (i, word) in text.split_whitespace().enumerate() {
            let mut hasher = Sha256::new();
            hasher.update(word.as_bytes());
            let digest = hasher.finalize();
            let bucket = (u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize)
                % self.dimension;
            let sign = if digest[4] % 2 == 0 { 1.0 } else { -1.0 };
            out[bucket] += sign / (1.0 + i as f32 * 0.01);
        }
        let norm: f32 = out.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in out.iter_mut() {
                *v /= norm;
            }
        }
        out
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        (dot / (na * nb)) as f64
    }
}

/// `sha256(query)[:16]` embedding cache key, TTL = 7 days (spec.md §4.4
/// step 1).
fn embedding_cache_key(query: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

struct CachedEmbedding {
    vector: Vec<f32>,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub entry: CachedEntry,
}

/// A content-addressed store of approved question/answer pairs. Search
/// failures return an empty list at zero cost and never raise; store
/// failures are reported, never silently dropped (spec.md §4.4).
pub struct KnowledgeCache {
    entries: RwLock<HashMap<Uuid, CachedEntry>>,
    embedding_cache: RwLock<HashMap<String, CachedEmbedding>>,
    embedder: Box<dyn Embedder>,
}

/// Cost of embedding `question ++ answer` as a pair, charged by the
/// caller to the Cost Controller's `embeddings` category.
pub struct EmbeddingCost {
    pub tokens: u32,
}

impl KnowledgeCache {
    pub fn new(embedder: Box<dyn Embedder>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            embedding_cache: RwLock::new(HashMap::new()),
            embedder,
        }
    }

    fn embed_cached(&self, text: &str) -> Vec<f32> {
        let key = embedding_cache_key(text);
        let now = Utc::now();
        {
            let cache = self.embedding_cache.read().unwrap();
            if let Some(hit) = cache.get(&key) {
                if hit.expires_at > now {
                    return hit.vector.clone();
                }
            }
        }
        let vector = self.embedder.embed(text);
        self.embedding_cache.write().unwrap().insert(
            key,
            CachedEmbedding { vector: vector.clone(), expires_at: now + chrono::Duration::days(EMBEDDING_TTL_DAYS) },
        );
        vector
    }

    /// Hybrid vector + keyword search fused by Reciprocal Rank Fusion.
    /// Never raises: a search failure is represented as an empty `Vec`.
    pub fn search(&self, query: &str, top_k: usize) -> Vec<SearchHit> {
        let entries = match self.entries.read() {
            Ok(g) => g,
            Err(_) => return Vec::new(),
        };
        if entries.is_empty() {
            return Vec::new();
        }

        let k = (2 * top_k).max(1);
        let query_embedding = self.embed_cached(query);

        let mut vector_ranked: Vec<(Uuid, f64)> = entries
            .values()
            .map(|e| (e.id, cosine(&query_embedding, &e.question_embedding)))
            .collect();
        vector_ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        vector_ranked.truncate(k);

        let mut keyword_ranked: Vec<(Uuid, f64)> = entries
            .values()
            .map(|e| (e.id, bm25_score(query, &format!("{} {}", e.question, e.answer))))
            .collect();
        keyword_ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        keyword_ranked.truncate(k);

        let fused = reciprocal_rank_fusion(&vector_ranked, &keyword_ranked, RRF_K);

        // Raw RRF scores top out at 2/(k+1) (rank 1 in both lists), far
        // below the [0,1] scale `relevance_score`/`CACHE_HIT_THRESHOLD`
        // are specified on. Normalize against that ceiling so "ranked
        // first by both signals" reads as a perfect match.
        let rrf_ceiling = 2.0 / (RRF_K + 1.0);

        let mut fused: Vec<(Uuid, f64)> = fused.into_iter().map(|(id, score)| (id, score / rrf_ceiling)).collect();
        fused.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        fused.truncate(top_k);

        fused
            .into_iter()
            .filter_map(|(id, score)| {
                entries.get(&id).map(|e| {
                    let mut entry = e.clone();
                    entry.relevance_score = Some(score);
                    SearchHit { entry }
                })
            })
            .collect()
    }

    /// Store a newly approved answer. Returns `(id, embedding_cost)`.
    /// Failures here must propagate — the expert answer would otherwise
    /// be silently lost (spec.md §4.4).
    pub fn store(
        &self,
        question: &str,
        answer: &str,
        approved_by: &str,
        category: &str,
        human_modified: bool,
    ) -> OrchestratorResult<(Uuid, EmbeddingCost)> {
        let question_embedding = self.embed_cached(question);
        let answer_embedding = self.embed_cached(answer);
        let id = Uuid::new_v4();
        let entry = CachedEntry {
            id,
            question: question.to_string(),
            answer: answer.to_string(),
            question_embedding,
            answer_embedding,
            metadata: CacheMetadata {
                human_approved: true,
                approved_by: approved_by.to_string(),
                approval_timestamp: Utc::now(),
                category: category.to_string(),
                human_modified,
                times_asked: 0,
                effectiveness_score: None,
            },
            relevance_score: None,
        };

        let mut entries = self
            .entries
            .write()
            .map_err(|_| OrchestratorError::Cache("store lock poisoned".into()))?;
        entries.insert(id, entry);

        let tokens = (question.split_whitespace().count() + answer.split_whitespace().count()) as u32;
        Ok((id, EmbeddingCost { tokens }))
    }

    /// Best-effort increment of `times_asked` on a match; never blocks
    /// `search` and never fails the caller.
    pub fn record_asked(&self, id: Uuid) {
        if let Ok(mut entries) = self.entries.write() {
            if let Some(e) = entries.get_mut(&id) {
                e.metadata.times_asked += 1;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Crude BM25-ish keyword overlap score. Real deployments would reach
/// for a proper inverted index (the pack's `usearch`/`tantivy`-backed
/// retrieval crates are the enrichment path); this keeps the fusion
/// math exercised without an external index.
fn bm25_score(query: &str, document: &str) -> f64 {
    let query_terms: Vec<String> = query.to_lowercase().split_whitespace().map(String::from).collect();
    if query_terms.is_empty() {
        return 0.0;
    }
    let doc_lower = document.to_lowercase();
    let doc_terms: Vec<&str> = doc_lower.split_whitespace().collect();
    let doc_len = doc_terms.len().max(1) as f64;
    let avg_len = 20.0;
    let k1 = 1.5;
    let b = 0.75;

    query_terms
        .iter()
        .map(|term| {
            let tf = doc_terms.iter().filter(|t| *t == term).count() as f64;
            if tf == 0.0 {
                return 0.0;
            }
            let numerator = tf * (k1 + 1.0);
            let denominator = tf + k1 * (1.0 - b + b * (doc_len / avg_len));
            numerator / denominator
        })
        .sum()
}

/// `score(id) = sum(1 / (k + rank))` over both ranked lists. Commutative
/// in the two lists when their lengths match (spec.md §8).
fn reciprocal_rank_fusion(
    list_a: &[(Uuid, f64)],
    list_b: &[(Uuid, f64)],
    k: f64,
) -> HashMap<Uuid, f64> {
    let mut scores: HashMap<Uuid, f64> = HashMap::new();
    for (rank, (id, _)) in list_a.iter().enumerate() {
        *scores.entry(*id).or_insert(0.0) += 1.0 / (k + (rank + 1) as f64);
    }
    for (rank, (id, _)) in list_b.iter().enumerate() {
        *scores.entry(*id).or_insert(0.0) += 1.0 / (k + (rank + 1) as f64);
    }
    scores
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> KnowledgeCache {
        KnowledgeCache::new(Box::new(HashingEmbedder::new(384)))
    }

    #[test]
    fn store_then_search_returns_stored_id_as_rank_one() {
        let cache = cache();
        let (id, cost) = cache
            .store("How do I auth?", "Use bearer token", "alice", "auth", false)
            .unwrap();
        assert!(cost.tokens > 0);

        let hits = cache.search("How do I auth?", 5);
        assert!(!hits.is_empty());
        assert_eq!(hits[0].entry.id, id);
        assert!(hits[0].entry.relevance_score.unwrap() >= CACHE_HIT_THRESHOLD);
    }

    #[test]
    fn search_on_empty_cache_is_empty_not_error() {
        let cache = cache();
        assert!(cache.search("anything", 5).is_empty());
    }

    #[test]
    fn rrf_is_commutative_when_lengths_match() {
        let a = vec![(Uuid::new_v4(), 0.0), (Uuid::new_v4(), 0.0)];
        let b = vec![(Uuid::new_v4(), 0.0), (Uuid::new_v4(), 0.0)];
        // reuse ids across both lists to exercise fusion overlap
        let shared_ids: Vec<Uuid> = (0..2).map(|_| Uuid::new_v4()).collect();
        let list_a: Vec<(Uuid, f64)> = shared_ids.iter().map(|id| (*id, 0.0)).collect();
        let mut list_b = list_a.clone();
        list_b.reverse();

        let fused_ab = reciprocal_rank_fusion(&list_a, &list_b, RRF_K);
        let fused_ba = reciprocal_rank_fusion(&list_b, &list_a, RRF_K);
        for id in &shared_ids {
            assert_eq!(fused_ab.get(id), fused_ba.get(id));
        }
        let _ = (a, b);
    }

    #[test]
    fn record_asked_increments_times_asked() {
        let cache = cache();
        let (id, _) = cache.store("q", "a", "alice", "general", false).unwrap();
        cache.record_asked(id);
        cache.record_asked(id);
        let hits = cache.search("q", 1);
        assert_eq!(hits[0].entry.metadata.times_asked, 0); // search doesn't mutate
        let entries = cache.entries.read().unwrap();
        assert_eq!(entries.get(&id).unwrap().metadata.times_asked, 2);
    }
}
