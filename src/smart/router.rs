//! Smart router: free-text intent to capability.
//!
//! The index tracks the registry's generation. Queries first bring the index
//! up to date, so a capability disabled before a query is never returned by
//! it. Rebuilds are serialized behind one lock and coalesce: a caller that
//! waited for another rebuild re-checks the generation before doing any work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::embedding::{l2_normalize, EmbeddingProvider};
use super::errors::SmartError;
use super::index::{RebuildPlan, ScoredCapability, SemanticIndex};
use crate::config::SmartSettings;
use crate::registry::{CapabilityKind, CapabilityRegistry};

/// Capability kinds that are routable by intent.
const INDEXED_KINDS: [CapabilityKind; 2] = [CapabilityKind::Tool, CapabilityKind::Prompt];

/// Quiet period after a registry change before the background rebuild runs.
const REBUILD_DEBOUNCE: Duration = Duration::from_millis(250);

/// Health of the smart router, for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct SmartStatus {
    pub enabled: bool,
    pub available: bool,
    pub indexed: usize,
    pub generation: u64,
    pub last_error: Option<String>,
}

/// Semantic router over the registry's enabled tools and prompts.
pub struct SmartRouter {
    registry: Arc<CapabilityRegistry>,
    provider: Option<Arc<dyn EmbeddingProvider>>,
    settings: SmartSettings,
    index: RwLock<SemanticIndex>,
    rebuild_lock: tokio::sync::Mutex<()>,
    available: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl SmartRouter {
    /// Build a router. With no provider every query is `Disabled`.
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        provider: Option<Arc<dyn EmbeddingProvider>>,
        settings: SmartSettings,
    ) -> Self {
        Self {
            registry,
            provider,
            settings,
            index: RwLock::new(SemanticIndex::new()),
            rebuild_lock: tokio::sync::Mutex::new(()),
            available: AtomicBool::new(true),
            last_error: Mutex::new(None),
        }
    }

    fn provider(&self) -> Result<&Arc<dyn EmbeddingProvider>, SmartError> {
        self.provider.as_ref().ok_or(SmartError::Disabled)
    }

    fn index_generation(&self) -> u64 {
        self.index.read().map(|i| i.generation()).unwrap_or(0)
    }

    fn record_outcome<T>(&self, result: &Result<T, SmartError>) {
        match result {
            Ok(_) => {
                self.available.store(true, Ordering::SeqCst);
                if let Ok(mut last) = self.last_error.lock() {
                    *last = None;
                }
            }
            Err(e) => {
                self.available.store(false, Ordering::SeqCst);
                if let Ok(mut last) = self.last_error.lock() {
                    *last = Some(e.to_string());
                }
            }
        }
    }

    /// Bring the index up to the registry's current generation.
    pub async fn ensure_fresh(&self) -> Result<(), SmartError> {
        let provider = Arc::clone(self.provider()?);
        if self.index_generation() == self.registry.generation() {
            return Ok(());
        }

        let _guard = self.rebuild_lock.lock().await;
        let target = self.registry.generation();
        if self.index_generation() == target {
            return Ok(());
        }

        let result = self.rebuild(provider.as_ref(), target).await;
        self.record_outcome(&result);
        result
    }

    /// Incremental rebuild, falling back to a full rebuild when the
    /// incremental result cannot be applied.
    async fn rebuild(&self, provider: &dyn EmbeddingProvider, target: u64) -> Result<(), SmartError> {
        let current = self.registry.enabled_capabilities(&INDEXED_KINDS);
        let plan = match self.index.read() {
            Ok(index) => index.plan(&current),
            Err(_) => RebuildPlan::default(),
        };

        if plan.is_empty() {
            if let Ok(mut index) = self.index.write() {
                index.mark_current(target);
            }
            return Ok(());
        }

        let embedded = plan.to_embed.len();
        let removed = plan.to_remove.len();
        let vectors = embed_all(provider, plan.to_embed.iter().map(|(c, _)| c.embedding_text())).await?;

        let applied = match self.index.write() {
            Ok(mut index) => index.apply(plan, vectors, target),
            Err(_) => Err(SmartError::RequestFailed {
                reason: "index lock poisoned".into(),
            }),
        };

        match applied {
            Ok(()) => {
                tracing::info!(embedded, removed, generation = target, "semantic index updated");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "incremental index update failed, rebuilding from scratch");
                self.full_rebuild(provider, target).await
            }
        }
    }

    async fn full_rebuild(&self, provider: &dyn EmbeddingProvider, target: u64) -> Result<(), SmartError> {
        let current = self.registry.enabled_capabilities(&INDEXED_KINDS);
        let mut fresh = SemanticIndex::new();
        let plan = fresh.plan(&current);
        let vectors = embed_all(provider, plan.to_embed.iter().map(|(c, _)| c.embedding_text())).await?;
        fresh.apply(plan, vectors, target)?;

        let count = fresh.len();
        if let Ok(mut index) = self.index.write() {
            *index = fresh;
        }
        tracing::info!(indexed = count, generation = target, "semantic index rebuilt");
        Ok(())
    }

    /// Capabilities matching `intent` above the relevance threshold, best
    /// first, at most `top_k`. An empty result means no confident match.
    pub async fn query(&self, intent: &str) -> Result<Vec<ScoredCapability>, SmartError> {
        self.ensure_fresh().await?;
        let provider = self.provider()?;

        let is_empty = self.index.read().map(|i| i.is_empty()).unwrap_or(true);
        if is_empty {
            return Ok(Vec::new());
        }

        let result = embed_all(provider.as_ref(), std::iter::once(intent.to_string())).await;
        self.record_outcome(&result);
        let query = result?
            .into_iter()
            .next()
            .ok_or(SmartError::EmptyResponse { count: 1 })?;

        let registry = &self.registry;
        let hits = self
            .index
            .read()
            .map(|index| {
                index.search(&query, self.settings.min_relevance, self.settings.top_k, |key| {
                    registry.is_enabled(key)
                })
            })
            .unwrap_or_default();

        tracing::debug!(intent, hits = hits.len(), "smart query");
        Ok(hits)
    }

    /// The single top-ranked match, if any clears the threshold.
    pub async fn best_match(&self, intent: &str) -> Result<Option<ScoredCapability>, SmartError> {
        Ok(self.query(intent).await?.into_iter().next())
    }

    pub fn status(&self) -> SmartStatus {
        SmartStatus {
            enabled: self.provider.is_some(),
            available: self.provider.is_some() && self.available.load(Ordering::SeqCst),
            indexed: self.index.read().map(|i| i.len()).unwrap_or(0),
            generation: self.index_generation(),
            last_error: self.last_error.lock().ok().and_then(|e| e.clone()),
        }
    }

    /// Keep the index warm in the background until `stop` flips to `true`.
    ///
    /// Returns `None` when smart routing is disabled.
    pub fn spawn_rebuilder(self: &Arc<Self>, mut stop: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        self.provider.as_ref()?;
        let router = Arc::clone(self);
        let mut changes = self.registry.subscribe();
        Some(tokio::spawn(async move {
            loop {
                if let Err(e) = router.ensure_fresh().await {
                    tracing::warn!(error = %e, "background index rebuild failed");
                }
                tokio::select! {
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = stop.changed() => break,
                }
                if *stop.borrow() {
                    break;
                }
                tokio::time::sleep(REBUILD_DEBOUNCE).await;
            }
            tracing::debug!("index rebuilder stopped");
        }))
    }
}

/// Embed texts and L2-normalize the result, checking the count.
async fn embed_all(
    provider: &dyn EmbeddingProvider,
    texts: impl Iterator<Item = String>,
) -> Result<Vec<Vec<f32>>, SmartError> {
    let texts: Vec<String> = texts.collect();
    if texts.is_empty() {
        return Ok(Vec::new());
    }
    let vectors = provider.embed(&texts).await?;
    if vectors.len() != texts.len() {
        return Err(SmartError::CountMismatch {
            expected: texts.len(),
            actual: vectors.len(),
        });
    }
    Ok(vectors.into_iter().map(l2_normalize).collect())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::NamespacedKey;
    use crate::testing::FakeEmbedder;
    use crate::upstream::connection::ConnectionState;
    use crate::upstream::types::{DiscoveredCapabilities, ToolDefinition, UpstreamServerSpec};

    fn publish(registry: &CapabilityRegistry, server: &str, tools: &[(&str, &str)]) {
        let discovered = DiscoveredCapabilities {
            tools: tools
                .iter()
                .map(|(name, desc)| ToolDefinition {
                    name: name.to_string(),
                    description: Some(desc.to_string()),
                    input_schema: serde_json::json!({}),
                })
                .collect(),
            ..Default::default()
        };
        registry.publish_server(
            &UpstreamServerSpec::stdio(server, "cmd", &[]),
            ConnectionState::Connected,
            &discovered,
        );
    }

    fn router(registry: &Arc<CapabilityRegistry>, embedder: &Arc<FakeEmbedder>) -> SmartRouter {
        SmartRouter::new(
            Arc::clone(registry),
            Some(Arc::clone(embedder) as Arc<dyn EmbeddingProvider>),
            SmartSettings {
                enabled: true,
                min_relevance: 0.5,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_query_finds_matching_tool() {
        let registry = Arc::new(CapabilityRegistry::new());
        publish(&registry, "weather", &[("forecast", "weather forecast for a city")]);
        publish(&registry, "fs", &[("read_file", "read a file from disk")]);
        let embedder = Arc::new(FakeEmbedder::new());
        let router = router(&registry, &embedder);

        let best = router.best_match("weather forecast city").await.unwrap().unwrap();
        assert_eq!(best.key.to_string(), "weather__forecast");
    }

    #[tokio::test]
    async fn test_no_confident_match_is_empty() {
        let registry = Arc::new(CapabilityRegistry::new());
        publish(&registry, "fs", &[("read_file", "read a file from disk")]);
        let embedder = Arc::new(FakeEmbedder::new());
        let router = router(&registry, &embedder);

        assert!(router.query("translate japanese poetry").await.unwrap().is_empty());
        assert!(router.best_match("translate japanese poetry").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ties_resolve_by_key() {
        let registry = Arc::new(CapabilityRegistry::new());
        publish(&registry, "b", &[("search", "search the web")]);
        publish(&registry, "a", &[("search", "search the web")]);
        let embedder = Arc::new(FakeEmbedder::new());
        let router = router(&registry, &embedder);

        let hits = router.query("search the web").await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].score, hits[1].score);
        assert_eq!(hits[0].key.to_string(), "a__search");
        assert_eq!(router.best_match("search the web").await.unwrap().unwrap().key.server, "a");
    }

    #[tokio::test]
    async fn test_incremental_rebuild_and_disablement() {
        let registry = Arc::new(CapabilityRegistry::new());
        publish(&registry, "weather", &[("forecast", "weather forecast"), ("alerts", "storm alerts")]);
        let embedder = Arc::new(FakeEmbedder::new());
        let router = router(&registry, &embedder);

        router.ensure_fresh().await.unwrap();
        assert_eq!(embedder.embedded_texts(), 2);
        assert_eq!(router.status().indexed, 2);

        // No change: nothing re-embedded.
        router.ensure_fresh().await.unwrap();
        assert_eq!(embedder.embedded_texts(), 2);

        // Disabling removes from the index without re-embedding the rest.
        let key = NamespacedKey::new(CapabilityKind::Tool, "weather", "forecast");
        registry.set_enabled(&key, false).unwrap();
        assert!(router.query("weather forecast").await.unwrap().iter().all(|h| h.key != key));
        assert_eq!(router.status().indexed, 1);
        assert_eq!(embedder.embedded_texts(), 2 + 1);
    }

    #[tokio::test]
    async fn test_provider_outage_is_reported() {
        let registry = Arc::new(CapabilityRegistry::new());
        publish(&registry, "fs", &[("read_file", "read a file")]);
        let embedder = Arc::new(FakeEmbedder::new());
        embedder.set_available(false);
        let router = router(&registry, &embedder);

        assert!(router.query("read a file").await.is_err());
        let status = router.status();
        assert!(!status.available);
        assert!(status.last_error.is_some());

        embedder.set_available(true);
        assert_eq!(router.query("read a file").await.unwrap().len(), 1);
        assert!(router.status().available);
    }

    #[tokio::test]
    async fn test_disabled_router() {
        let registry = Arc::new(CapabilityRegistry::new());
        let router = SmartRouter::new(registry, None, SmartSettings::default());
        assert!(matches!(router.query("x").await.unwrap_err(), SmartError::Disabled));
        assert!(!router.status().enabled);
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_coalesce() {
        let registry = Arc::new(CapabilityRegistry::new());
        publish(&registry, "fs", &[("read_file", "read a file"), ("write_file", "write a file")]);
        let embedder = Arc::new(FakeEmbedder::new());
        let router = Arc::new(router(&registry, &embedder));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = Arc::clone(&router);
                tokio::spawn(async move { r.ensure_fresh().await })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(embedder.embedded_texts(), 2);
    }

    #[tokio::test]
    async fn test_background_rebuilder_tracks_registry() {
        let registry = Arc::new(CapabilityRegistry::new());
        let embedder = Arc::new(FakeEmbedder::new());
        let router = Arc::new(router(&registry, &embedder));
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = router.spawn_rebuilder(stop_rx).unwrap();

        publish(&registry, "fs", &[("read_file", "read a file")]);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while router.status().indexed == 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(router.status().indexed, 1);

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
