//! Semantic index over capability descriptions.
//!
//! Entries remember a hash of the text they were embedded from, so an
//! incremental rebuild only re-embeds capabilities that are new or whose
//! description changed, and drops the ones that disappeared.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};

use super::embedding::cosine_similarity;
use super::errors::SmartError;
use crate::registry::{Capability, NamespacedKey};

/// One indexed capability.
#[derive(Debug, Clone)]
pub struct SemanticIndexEntry {
    pub key: NamespacedKey,
    /// L2-normalized embedding.
    pub vector: Vec<f32>,
    pub description_hash: String,
}

/// A query hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredCapability {
    pub key: NamespacedKey,
    pub score: f32,
}

/// Work needed to bring the index up to date.
#[derive(Debug, Default)]
pub struct RebuildPlan {
    /// Capabilities to (re-)embed, with their description hash.
    pub to_embed: Vec<(Arc<Capability>, String)>,
    pub to_remove: Vec<NamespacedKey>,
}

impl RebuildPlan {
    pub fn is_empty(&self) -> bool {
        self.to_embed.is_empty() && self.to_remove.is_empty()
    }
}

/// SHA-256 of the text a capability is embedded from.
pub fn description_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Vector index keyed by namespaced capability key.
#[derive(Debug, Default)]
pub struct SemanticIndex {
    entries: HashMap<NamespacedKey, SemanticIndexEntry>,
    dimension: Option<usize>,
    /// Registry generation this index reflects.
    generation: u64,
}

impl SemanticIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn contains(&self, key: &NamespacedKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Diff the index against the capabilities that should be indexed.
    pub fn plan(&self, current: &[Arc<Capability>]) -> RebuildPlan {
        let mut plan = RebuildPlan::default();
        let mut wanted = HashSet::with_capacity(current.len());

        for capability in current {
            wanted.insert(&capability.key);
            let hash = description_hash(&capability.embedding_text());
            let fresh = self
                .entries
                .get(&capability.key)
                .is_some_and(|e| e.description_hash == hash);
            if !fresh {
                plan.to_embed.push((Arc::clone(capability), hash));
            }
        }

        plan.to_remove = self
            .entries
            .keys()
            .filter(|k| !wanted.contains(k))
            .cloned()
            .collect();
        plan
    }

    /// Apply a plan with the vectors computed for `plan.to_embed`.
    ///
    /// Fails without modifying anything if a vector's dimension disagrees
    /// with the index; the caller then falls back to a full rebuild.
    pub fn apply(
        &mut self,
        plan: RebuildPlan,
        vectors: Vec<Vec<f32>>,
        generation: u64,
    ) -> Result<(), SmartError> {
        if vectors.len() != plan.to_embed.len() {
            return Err(SmartError::CountMismatch {
                expected: plan.to_embed.len(),
                actual: vectors.len(),
            });
        }

        let surviving = self.entries.len() - plan.to_remove.len();
        let mut dimension = if surviving > 0 { self.dimension } else { None };
        for vector in &vectors {
            match dimension {
                Some(expected) if expected != vector.len() => {
                    return Err(SmartError::DimensionMismatch {
                        expected,
                        actual: vector.len(),
                    });
                }
                _ => dimension = Some(vector.len()),
            }
        }

        for key in &plan.to_remove {
            self.entries.remove(key);
        }
        for ((capability, hash), vector) in plan.to_embed.into_iter().zip(vectors) {
            self.entries.insert(
                capability.key.clone(),
                SemanticIndexEntry {
                    key: capability.key.clone(),
                    vector,
                    description_hash: hash,
                },
            );
        }
        self.dimension = if self.entries.is_empty() { None } else { dimension };
        self.generation = generation;
        Ok(())
    }

    /// Record that the index reflects `generation` without changes.
    pub fn mark_current(&mut self, generation: u64) {
        self.generation = generation;
    }

    /// Entries scoring at least `min_relevance`, best first.
    ///
    /// Equal scores are ordered by namespaced key so ties resolve the same
    /// way every time. Entries rejected by `include` are skipped.
    pub fn search(
        &self,
        query: &[f32],
        min_relevance: f32,
        top_k: usize,
        include: impl Fn(&NamespacedKey) -> bool,
    ) -> Vec<ScoredCapability> {
        if self.dimension.is_some_and(|d| d != query.len()) {
            return Vec::new();
        }

        let mut scored: Vec<ScoredCapability> = self
            .entries
            .values()
            .filter(|e| include(&e.key))
            .map(|e| ScoredCapability {
                key: e.key.clone(),
                score: cosine_similarity(query, &e.vector),
            })
            .filter(|s| s.score >= min_relevance)
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.key.qualified().cmp(&b.key.qualified()))
        });
        scored.truncate(top_k);
        scored
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
