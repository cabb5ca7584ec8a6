//! Response cache addon.
//!
//! Keys on the (prompt, model, provider) triple — the prompt as it stands
//! when the hook runs, so a minimizer registered earlier in the chain makes
//! equivalent prompts share an entry. In-memory only, bounded by LRU
//! eviction, with optional TTL expiry.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use costrail_core::addon::{Addon, AddonContext, PreRequestOutcome, keys};
use costrail_core::error::AddonError;
use costrail_core::provider::ChatResponse;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;

struct CacheEntry {
    response: ChatResponse,
    inserted_at: DateTime<Utc>,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// Access order for LRU eviction: least recently used first.
    access_order: Vec<String>,
}

/// Caches provider responses and answers repeat requests without a call.
///
/// On a hit the `pre_request` hook returns the stored content as a
/// `FinalResponse` and sets `cache_hit = true` in the context; on a miss it
/// leaves `cache_hit = false` plus the computed key, and the `post_request`
/// hook stores the fresh response under that key.
pub struct CacheAddon {
    max_size: usize,
    ttl: Option<Duration>,
    state: Mutex<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
    enabled: AtomicBool,
}

impl CacheAddon {
    /// Create a cache bounded at `max_size` entries with a TTL in seconds
    /// (`None` = entries never expire).
    pub fn new(max_size: usize, ttl_seconds: Option<u64>) -> Self {
        Self {
            max_size: max_size.max(1),
            ttl: ttl_seconds.map(|s| Duration::seconds(s as i64)),
            state: Mutex::new(CacheState::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            enabled: AtomicBool::new(true),
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    /// Deterministic key over the request identity.
    fn cache_key(prompt: &str, model: &str, provider: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(provider.as_bytes());
        hasher.update([0u8]);
        hasher.update(model.as_bytes());
        hasher.update([0u8]);
        hasher.update(prompt.as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    fn is_expired(&self, entry: &CacheEntry) -> bool {
        match self.ttl {
            Some(ttl) => Utc::now() > entry.inserted_at + ttl,
            None => false,
        }
    }

    /// Drop all cached entries. Statistics are preserved.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.entries.clear();
        state.access_order.clear();
    }

    /// Number of cached entries.
    pub fn size(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    /// Hit/miss statistics since creation.
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            total_requests: total,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
            size: self.size(),
            max_size: self.max_size,
        }
    }
}

/// Mark `key` most recently used.
fn touch(state: &mut CacheState, key: &str) {
    state.access_order.retain(|k| k != key);
    state.access_order.push(key.to_string());
}

#[async_trait]
impl Addon for CacheAddon {
    fn name(&self) -> &str {
        "cache"
    }

    fn description(&self) -> String {
        match self.ttl {
            Some(ttl) => format!(
                "Caches responses (max {} entries, TTL {}s)",
                self.max_size,
                ttl.num_seconds()
            ),
            None => format!("Caches responses (max {} entries, no TTL)", self.max_size),
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    async fn pre_request(
        &self,
        prompt: &str,
        ctx: &mut AddonContext,
    ) -> Result<PreRequestOutcome, AddonError> {
        let key = Self::cache_key(prompt, &ctx.model, &ctx.provider);

        let mut state = self.state.lock().unwrap();

        if let Some(entry) = state.entries.get(&key) {
            if self.is_expired(entry) {
                state.entries.remove(&key);
                state.access_order.retain(|k| k != &key);
            } else {
                let content = entry.response.content.clone();
                touch(&mut state, &key);
                drop(state);

                self.hits.fetch_add(1, Ordering::Relaxed);
                ctx.set_flag(keys::CACHE_HIT, true);
                ctx.custom
                    .insert(keys::CACHE_KEY.to_string(), key.clone().into());
                debug!(key = %&key[..12], "Cache hit");
                return Ok(PreRequestOutcome::FinalResponse(content));
            }
        }
        drop(state);

        self.misses.fetch_add(1, Ordering::Relaxed);
        ctx.set_flag(keys::CACHE_HIT, false);
        ctx.custom.insert(keys::CACHE_KEY.to_string(), key.into());
        Ok(PreRequestOutcome::Unchanged)
    }

    async fn post_request(
        &self,
        response: ChatResponse,
        ctx: &mut AddonContext,
    ) -> Result<ChatResponse, AddonError> {
        // Only store fresh responses, and only when the pre-request hook ran
        // for this call and left us a key.
        if !ctx.flag(keys::CACHE_HIT) {
            if let Some(key) = ctx.custom.get(keys::CACHE_KEY).and_then(|v| v.as_str()) {
                let key = key.to_string();
                let mut state = self.state.lock().unwrap();

                if state.entries.len() >= self.max_size && !state.entries.contains_key(&key) {
                    if let Some(lru) = state.access_order.first().cloned() {
                        state.entries.remove(&lru);
                        state.access_order.remove(0);
                        debug!(evicted = %&lru[..12], "Cache full, evicted LRU entry");
                    }
                }

                state.entries.insert(
                    key.clone(),
                    CacheEntry {
                        response: response.clone(),
                        inserted_at: Utc::now(),
                    },
                );
                touch(&mut state, &key);
            }
        }

        Ok(response)
    }
}

/// Cache statistics snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub total_requests: u64,
    pub hit_rate: f64,
    pub size: usize,
    pub max_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn ctx(prompt: &str) -> AddonContext {
        AddonContext::new("req-1", prompt, "gpt-4o-mini", "openai")
    }

    fn response(content: &str) -> ChatResponse {
        ChatResponse {
            content: content.into(),
            model: "gpt-4o-mini".into(),
            input_tokens: 10,
            output_tokens: 5,
            finish_reason: Some("stop".into()),
            metadata: Map::new(),
        }
    }

    async fn prime(cache: &CacheAddon, prompt: &str, content: &str) {
        let mut ctx = ctx(prompt);
        let outcome = cache.pre_request(prompt, &mut ctx).await.unwrap();
        assert_eq!(outcome, PreRequestOutcome::Unchanged);
        cache.post_request(response(content), &mut ctx).await.unwrap();
    }

    #[tokio::test]
    async fn second_identical_request_hits() {
        let cache = CacheAddon::new(10, Some(3600));
        prime(&cache, "what is rust?", "a systems language").await;

        let mut ctx = ctx("what is rust?");
        let outcome = cache.pre_request("what is rust?", &mut ctx).await.unwrap();

        assert_eq!(
            outcome,
            PreRequestOutcome::FinalResponse("a systems language".into())
        );
        assert!(ctx.flag(keys::CACHE_HIT));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn key_distinguishes_model_and_provider() {
        let cache = CacheAddon::new(10, None);
        prime(&cache, "hello", "answer").await;

        // Same prompt, different model → miss
        let mut other = AddonContext::new("req-2", "hello", "claude-sonnet-4", "anthropic");
        let outcome = cache.pre_request("hello", &mut other).await.unwrap();
        assert_eq!(outcome, PreRequestOutcome::Unchanged);
        assert!(!other.flag(keys::CACHE_HIT));
    }

    #[tokio::test]
    async fn lru_eviction_at_max_size() {
        let cache = CacheAddon::new(2, None);
        prime(&cache, "p1", "r1").await;
        prime(&cache, "p2", "r2").await;

        // Access p1 so p2 becomes least recently used
        let mut ctx1 = ctx("p1");
        cache.pre_request("p1", &mut ctx1).await.unwrap();

        // Inserting p3 evicts p2
        prime(&cache, "p3", "r3").await;
        assert_eq!(cache.size(), 2);

        let mut ctx2 = ctx("p2");
        let outcome = cache.pre_request("p2", &mut ctx2).await.unwrap();
        assert_eq!(outcome, PreRequestOutcome::Unchanged);

        // p1 and p3 are still cached
        let mut ctx1 = ctx("p1");
        assert!(matches!(
            cache.pre_request("p1", &mut ctx1).await.unwrap(),
            PreRequestOutcome::FinalResponse(_)
        ));
        let mut ctx3 = ctx("p3");
        assert!(matches!(
            cache.pre_request("p3", &mut ctx3).await.unwrap(),
            PreRequestOutcome::FinalResponse(_)
        ));
    }

    #[tokio::test]
    async fn ttl_expiry_is_a_miss() {
        // TTL of zero seconds: everything is expired by the next call
        let cache = CacheAddon::new(10, Some(0));
        prime(&cache, "p", "r").await;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let mut ctx = ctx("p");
        let outcome = cache.pre_request("p", &mut ctx).await.unwrap();
        assert_eq!(outcome, PreRequestOutcome::Unchanged);
        assert!(!ctx.flag(keys::CACHE_HIT));
        assert_eq!(cache.size(), 0);
    }

    #[tokio::test]
    async fn hit_is_not_restored() {
        let cache = CacheAddon::new(10, None);
        prime(&cache, "p", "r").await;

        // A hit flows through post_request too; it must not re-insert
        let mut ctx1 = ctx("p");
        cache.pre_request("p", &mut ctx1).await.unwrap();
        cache.post_request(response("different"), &mut ctx1).await.unwrap();

        let mut ctx2 = ctx("p");
        let outcome = cache.pre_request("p", &mut ctx2).await.unwrap();
        assert_eq!(outcome, PreRequestOutcome::FinalResponse("r".into()));
    }

    #[tokio::test]
    async fn clear_keeps_stats() {
        let cache = CacheAddon::new(10, None);
        prime(&cache, "p", "r").await;
        cache.clear();

        assert_eq!(cache.size(), 0);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn disable_toggles() {
        let cache = CacheAddon::new(10, None);
        assert!(cache.is_enabled());
        cache.disable();
        assert!(!cache.is_enabled());
        cache.enable();
        assert!(cache.is_enabled());
    }

    #[test]
    fn keys_are_stable_hex() {
        let a = CacheAddon::cache_key("p", "m", "prov");
        let b = CacheAddon::cache_key("p", "m", "prov");
        let c = CacheAddon::cache_key("p2", "m", "prov");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
