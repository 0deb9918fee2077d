//! Response Cache - exact and similarity-based lookup keyed by
//! (normalized prompt, model), with LRU eviction, content-type-aware TTL,
//! and optional persistence.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::{CacheConfig, ContentType};
use crate::context::{CacheHitInfo, PipelineContext};
use crate::error::ShieldResult;
use crate::events::{EventSink, PipelineEvent};
use crate::logging::log_debug;
use crate::normalize::{normalize, similarity};
use crate::pipeline::Stage;
use crate::storage::StorageAdapter;

const CACHE_STORAGE_PREFIX: &str = "cache:";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub normalized_key: String,
    pub prompt: String,
    pub response: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub created_at: i64,
    pub access_count: u64,
    pub last_accessed: i64,
    pub content_type: ContentTypeRepr,
}

/// Serde-friendly mirror of [`ContentType`] (which intentionally carries
/// no serde derive since it's pure stage config elsewhere).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentTypeRepr {
    Factual,
    General,
    TimeSensitive,
}

impl From<ContentType> for ContentTypeRepr {
    fn from(c: ContentType) -> Self {
        match c {
            ContentType::Factual => Self::Factual,
            ContentType::General => Self::General,
            ContentType::TimeSensitive => Self::TimeSensitive,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheHitType {
    Exact,
    Fuzzy,
}

#[derive(Debug, Clone)]
pub struct CacheLookupHit {
    pub entry: CacheEntry,
    pub hit_type: CacheHitType,
    pub similarity: f64,
}

static FACTUAL_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"^(what|who|when|where) is\b",
        r"^define\b",
        r"capital of",
        r"^how many\b",
        r"^how much\b",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static TIME_SENSITIVE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\btoday\b",
        r"\bnow\b",
        r"\bcurrent(ly)?\b",
        r"\blatest\b",
        r"\bthis (week|month|year)\b",
        r"\bbreaking\b",
        r"\bright now\b",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Classify a normalized prompt into a TTL bucket. Time-sensitive patterns
/// are checked first since a factual-shaped question about "today's
/// weather" should still expire quickly.
pub fn classify_content_type(normalized_prompt: &str) -> ContentType {
    if TIME_SENSITIVE_PATTERNS.iter().any(|re| re.is_match(normalized_prompt)) {
        return ContentType::TimeSensitive;
    }
    if FACTUAL_PATTERNS.iter().any(|re| re.is_match(normalized_prompt)) {
        return ContentType::Factual;
    }
    ContentType::General
}

/// A lightweight bigram inverted index used as the "holographic" semantic
/// index: given a query it returns at most one best-overlap candidate
/// prompt, which the cache then re-verifies (TTL, model, prompt equality)
/// before trusting it as a fuzzy hit.
#[derive(Default)]
struct SemanticIndex {
    postings: HashMap<(char, char), Vec<String>>,
}

impl SemanticIndex {
    fn insert(&mut self, prompt: &str) {
        let normalized = normalize(prompt);
        let chars: Vec<char> = normalized.chars().collect();
        for w in chars.windows(2) {
            self.postings.entry((w[0], w[1])).or_default().push(prompt.to_string());
        }
    }

    fn query(&self, query: &str) -> Option<String> {
        let normalized = normalize(query);
        let chars: Vec<char> = normalized.chars().collect();
        if chars.len() < 2 {
            return None;
        }
        let mut scores: HashMap<&str, usize> = HashMap::new();
        for w in chars.windows(2) {
            if let Some(candidates) = self.postings.get(&(w[0], w[1])) {
                for candidate in candidates {
                    *scores.entry(candidate.as_str()).or_insert(0) += 1;
                }
            }
        }
        scores.into_iter().max_by_key(|(_, score)| *score).map(|(prompt, _)| prompt.to_string())
    }

    fn clear(&mut self) {
        self.postings.clear();
    }
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub total_saved_tokens: u64,
    pub total_hits: u64,
    pub total_lookups: u64,
    pub hit_rate: f64,
}

/// Exact + similarity-based response cache. Memory-resident map with
/// optional write-through persistence and an optional bigram-overlap
/// semantic index layered on top of the Dice-coefficient fuzzy scan.
pub struct ResponseCache {
    config: CacheConfig,
    memory: Mutex<HashMap<String, CacheEntry>>,
    semantic_index: Mutex<SemanticIndex>,
    storage: Arc<dyn StorageAdapter>,
    event_sink: Arc<dyn EventSink>,
    on_storage_error: Option<Box<dyn Fn(&str) + Send + Sync>>,
    total_hits: Mutex<u64>,
    total_lookups: Mutex<u64>,
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache").field("config", &self.config).finish_non_exhaustive()
    }
}

impl ResponseCache {
    pub fn new(config: CacheConfig, storage: Arc<dyn StorageAdapter>, event_sink: Arc<dyn EventSink>) -> Self {
        Self {
            config,
            memory: Mutex::new(HashMap::new()),
            semantic_index: Mutex::new(SemanticIndex::default()),
            storage,
            event_sink,
            on_storage_error: None,
            total_hits: Mutex::new(0),
            total_lookups: Mutex::new(0),
        }
    }

    pub fn with_storage_error_hook<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_storage_error = Some(Box::new(f));
        self
    }

    /// The djb2-hashed, base-36-encoded, `ts_`-prefixed exact lookup key.
    /// Non-collision-resistant by design - every read additionally
    /// verifies `entry.normalized_key` before trusting a hit.
    pub fn cache_key(prompt: &str, model: &str) -> String {
        let material = format!("{}|model:{}", normalize(prompt), model);
        let hash = djb2(&material);
        format!("ts_{}", to_base36(hash))
    }

    fn ttl_for(&self, content_type: ContentTypeRepr) -> Duration {
        match content_type {
            ContentTypeRepr::Factual => self.config.ttl_factual,
            ContentTypeRepr::General => self.config.ttl_general,
            ContentTypeRepr::TimeSensitive => self.config.ttl_time_sensitive,
        }
    }

    fn is_live(&self, entry: &CacheEntry, now: i64) -> bool {
        let ttl = self.ttl_for(entry.content_type);
        now - entry.created_at < ttl.as_secs() as i64
    }

    fn storage_key(key: &str) -> String {
        format!("{CACHE_STORAGE_PREFIX}{key}")
    }

    /// Full lookup protocol: exact memory hit, then persistent storage,
    /// then (if enabled) a similarity scan. Mutating: bumps `access_count`
    /// and `last_accessed` on a hit via copy-on-read, and counts toward
    /// `total_lookups`/`total_hits`.
    pub async fn lookup(&self, prompt: &str, model: &str) -> Option<CacheLookupHit> {
        *self.total_lookups.lock().unwrap() += 1;
        let hit = self.lookup_inner(prompt, model, true).await;
        if let Some(hit) = &hit {
            *self.total_hits.lock().unwrap() += 1;
            self.event_sink.emit(PipelineEvent::CacheHit { similarity: hit.similarity });
        } else {
            self.event_sink.emit(PipelineEvent::CacheMiss);
        }
        hit
    }

    /// Read-only lookup with the same resolution protocol but no
    /// copy-on-read write-back and no stats mutation - for dry-run use.
    pub async fn peek(&self, prompt: &str, model: &str) -> Option<CacheLookupHit> {
        self.lookup_inner(prompt, model, false).await
    }

    async fn lookup_inner(&self, prompt: &str, model: &str, write_back: bool) -> Option<CacheLookupHit> {
        let now = now_ts();
        let query_normalized = normalize(prompt);
        let key = Self::cache_key(prompt, model);

        // 1. exact memory hit
        {
            let mut memory = self.memory.lock().unwrap();
            if let Some(entry) = memory.get(&key) {
                if self.is_live(entry, now) && entry.normalized_key == query_normalized {
                    let mut updated = entry.clone();
                    updated.access_count += 1;
                    updated.last_accessed = now;
                    let result = updated.clone();
                    if write_back {
                        memory.insert(key.clone(), updated);
                    }
                    return Some(CacheLookupHit {
                        entry: result,
                        hit_type: CacheHitType::Exact,
                        similarity: 1.0,
                    });
                }
            }
        }

        // 2. persistent storage
        if let Ok(Some(raw)) = self.storage.get(&Self::storage_key(&key)).await {
            if let Ok(entry) = serde_json::from_str::<CacheEntry>(&raw) {
                if self.is_live(&entry, now) && entry.normalized_key == query_normalized {
                    if write_back {
                        let mut warmed = entry.clone();
                        warmed.access_count += 1;
                        warmed.last_accessed = now;
                        self.memory.lock().unwrap().insert(key.clone(), warmed.clone());
                        return Some(CacheLookupHit { entry: warmed, hit_type: CacheHitType::Exact, similarity: 1.0 });
                    }
                    return Some(CacheLookupHit { entry, hit_type: CacheHitType::Exact, similarity: 1.0 });
                }
            }
        }

        // 3. similarity scan (+ semantic index pre-filter)
        if self.config.similarity_threshold < 1.0 {
            if let Some(hit) = self.similarity_scan(prompt, model, now, write_back) {
                return Some(hit);
            }
        }

        None
    }

    fn similarity_scan(&self, prompt: &str, model: &str, now: i64, write_back: bool) -> Option<CacheLookupHit> {
        let mut memory = self.memory.lock().unwrap();

        if self.config.use_semantic_index {
            if let Some(candidate_prompt) = self.semantic_index.lock().unwrap().query(prompt) {
                if let Some((candidate_key, entry)) = memory
                    .iter()
                    .find(|(_, e)| e.prompt == candidate_prompt && e.model == model)
                    .map(|(k, e)| (k.clone(), e.clone()))
                {
                    if self.is_live(&entry, now) {
                        let sim = similarity(prompt, &entry.prompt);
                        if sim >= self.config.similarity_threshold {
                            let mut updated = entry.clone();
                            updated.access_count += 1;
                            updated.last_accessed = now;
                            if write_back {
                                memory.insert(candidate_key, updated.clone());
                            }
                            return Some(CacheLookupHit { entry: updated, hit_type: CacheHitType::Fuzzy, similarity: sim });
                        }
                    }
                }
            }
        }

        let mut best: Option<(String, CacheEntry, f64)> = None;
        for (k, entry) in memory.iter() {
            if entry.model != model || !self.is_live(entry, now) {
                continue;
            }
            let sim = similarity(prompt, &entry.prompt);
            if sim >= self.config.similarity_threshold {
                if best.as_ref().map(|(_, _, best_sim)| sim > *best_sim).unwrap_or(true) {
                    best = Some((k.clone(), entry.clone(), sim));
                }
            }
        }

        best.map(|(k, entry, sim)| {
            let mut updated = entry.clone();
            updated.access_count += 1;
            updated.last_accessed = now;
            if write_back {
                memory.insert(k, updated.clone());
            }
            CacheLookupHit { entry: updated, hit_type: CacheHitType::Fuzzy, similarity: sim }
        })
    }

    /// Store a new entry, evicting the least-recently-accessed entry if
    /// the memory map would exceed `max_entries`. Persists asynchronously;
    /// failures are swallowed and reported via `on_storage_error`.
    pub async fn store(&self, prompt: &str, response: &str, model: &str, input_tokens: u32, output_tokens: u32) {
        let now = now_ts();
        let key = Self::cache_key(prompt, model);
        let normalized_key = normalize(prompt);
        let content_type: ContentTypeRepr = classify_content_type(&normalized_key).into();

        let entry = CacheEntry {
            key: key.clone(),
            normalized_key,
            prompt: prompt.to_string(),
            response: response.to_string(),
            model: model.to_string(),
            input_tokens,
            output_tokens,
            created_at: now,
            access_count: 0,
            last_accessed: now,
            content_type,
        };

        {
            let mut memory = self.memory.lock().unwrap();
            memory.insert(key.clone(), entry.clone());
            if memory.len() > self.config.max_entries {
                if let Some(evict_key) = memory
                    .iter()
                    .min_by_key(|(_, e)| e.last_accessed)
                    .map(|(k, _)| k.clone())
                {
                    memory.remove(&evict_key);
                }
            }
        }

        if self.config.use_semantic_index {
            self.semantic_index.lock().unwrap().insert(prompt);
        }

        match serde_json::to_string(&entry) {
            Ok(payload) => {
                if let Err(e) = self.storage.set(&Self::storage_key(&key), &payload).await {
                    log_debug!(error = %e, "cache persistence failed");
                    if let Some(hook) = &self.on_storage_error {
                        hook(&e.to_string());
                    }
                }
            }
            Err(e) => log_debug!(error = %e, "cache entry serialization failed"),
        }
    }

    /// Drop every entry and reset stats counters.
    pub fn clear(&self) {
        self.memory.lock().unwrap().clear();
        self.semantic_index.lock().unwrap().clear();
        *self.total_hits.lock().unwrap() = 0;
        *self.total_lookups.lock().unwrap() = 0;
    }

    /// Load every surviving (non-expired) entry from storage into memory
    /// and the semantic index. Idempotent: a second call with no new
    /// storage writes warms nothing new.
    pub async fn hydrate(&self) {
        let Ok(keys) = self.storage.keys().await else { return };
        let now = now_ts();
        for key in keys {
            if !key.starts_with(CACHE_STORAGE_PREFIX) {
                continue;
            }
            let Ok(Some(raw)) = self.storage.get(&key).await else { continue };
            let Ok(entry) = serde_json::from_str::<CacheEntry>(&raw) else { continue };
            if !self.is_live(&entry, now) {
                let _ = self.storage.delete(&key).await;
                continue;
            }
            if self.config.use_semantic_index {
                self.semantic_index.lock().unwrap().insert(&entry.prompt);
            }
            self.memory.lock().unwrap().insert(entry.key.clone(), entry);
        }
    }

    pub fn stats(&self) -> CacheStats {
        let memory = self.memory.lock().unwrap();
        let total_saved_tokens: u64 = memory
            .values()
            .map(|e| (e.input_tokens as u64 + e.output_tokens as u64) * e.access_count)
            .sum();
        let total_hits = *self.total_hits.lock().unwrap();
        let total_lookups = *self.total_lookups.lock().unwrap();
        CacheStats {
            entries: memory.len(),
            total_saved_tokens,
            total_hits,
            total_lookups,
            hit_rate: if total_lookups > 0 { total_hits as f64 / total_lookups as f64 } else { 0.0 },
        }
    }
}

fn djb2(s: &str) -> u32 {
    let mut hash: u32 = 5381;
    for byte in s.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(byte as u32);
    }
    hash
}

fn to_base36(mut n: u32) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap()
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Stage wiring: a hit short-circuits the pipeline with `abort_reason ==
/// "cache-hit"`; a miss falls through so later stages run.
#[async_trait]
impl Stage for ResponseCache {
    fn name(&self) -> &str {
        "cache"
    }

    async fn run(&self, ctx: &mut PipelineContext) -> ShieldResult<()> {
        if let Some(hit) = self.lookup(&ctx.last_user_text, &ctx.model_id).await {
            ctx.meta.cache_hit = Some(CacheHitInfo {
                response: hit.entry.response,
                similarity: hit.similarity,
                input_tokens: hit.entry.input_tokens,
                output_tokens: hit.entry.output_tokens,
            });
            ctx.abort("cache-hit");
        }
        Ok(())
    }
}

#[cfg(test)]
mod cache_tests {
    use super::*;
    use crate::events::NullEventSink;
    use crate::storage::{InMemoryStorageAdapter, NullStorageAdapter};

    // UNIT UNDER TEST: ResponseCache lookup/store protocol
    // BUSINESS RESPONSIBILITY: a lookup hit must only ever be returned when
    //   the normalized query matches the stored normalized key and the
    //   entry is live; eviction must respect max_entries; Peek must never
    //   mutate state observable through a later Lookup/stats call.
    // TEST COVERAGE:
    //   - exact hit round-trips prompt/response/model
    //   - store respects max_entries via LRU eviction
    //   - fuzzy hit requires similarity >= threshold
    //   - expired entries are not returned as live
    //   - peek does not change stats or access_count
    //   - hydrate is idempotent

    fn cache(config: CacheConfig) -> ResponseCache {
        ResponseCache::new(config, Arc::new(NullStorageAdapter), Arc::new(NullEventSink))
    }

    #[tokio::test]
    async fn exact_hit_round_trips_stored_response() {
        // Arrange
        let c = cache(CacheConfig::default());
        c.store("What is the capital of France?", "Paris.", "gpt-4o-mini", 12, 8).await;

        // Act
        let hit = c.lookup("What is the capital of France?", "gpt-4o-mini").await.unwrap();

        // Assert
        assert_eq!(hit.entry.response, "Paris.");
        assert_eq!(hit.hit_type, CacheHitType::Exact);
        assert!((hit.similarity - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn lookup_misses_for_a_different_model() {
        // Arrange
        let c = cache(CacheConfig::default());
        c.store("hello there", "hi!", "gpt-4o-mini", 5, 2).await;

        // Act
        let hit = c.lookup("hello there", "gpt-4o").await;

        // Assert
        assert!(hit.is_none());
    }

    #[tokio::test]
    async fn store_evicts_least_recently_accessed_entry_past_max_entries() {
        // Arrange
        let config = CacheConfig {
            max_entries: 2,
            similarity_threshold: 1.0,
            ..Default::default()
        };
        let c = cache(config);

        // Act
        c.store("first prompt", "r1", "gpt-4o", 1, 1).await;
        c.store("second prompt", "r2", "gpt-4o", 1, 1).await;
        // touch "second prompt" so it's more recently accessed than "first prompt"
        c.lookup("second prompt", "gpt-4o").await;
        c.store("third prompt", "r3", "gpt-4o", 1, 1).await;
        let stats = c.stats();

        // Assert
        assert_eq!(stats.entries, 2);
        assert!(c.lookup("first prompt", "gpt-4o").await.is_none());
        assert!(c.lookup("second prompt", "gpt-4o").await.is_some());
        assert!(c.lookup("third prompt", "gpt-4o").await.is_some());
    }

    #[tokio::test]
    async fn fuzzy_hit_requires_similarity_at_or_above_threshold() {
        // Arrange
        let config = CacheConfig {
            similarity_threshold: 0.9,
            ..Default::default()
        };
        let c = cache(config);
        c.store("what is the capital of france", "Paris.", "gpt-4o", 12, 8).await;

        // Act
        let close = c.lookup("what's the capital of france", "gpt-4o").await;
        let far = c.lookup("tell me a joke about pizza", "gpt-4o").await;

        // Assert
        assert!(close.is_some());
        assert!(far.is_none());
    }

    #[tokio::test]
    async fn expired_entry_is_not_returned() {
        // Arrange
        let config = CacheConfig {
            ttl_general: Duration::from_secs(0),
            ..Default::default()
        };
        let c = cache(config);
        c.store("some general prompt", "response", "gpt-4o", 1, 1).await;

        // Act
        let hit = c.lookup("some general prompt", "gpt-4o").await;

        // Assert
        assert!(hit.is_none());
    }

    #[tokio::test]
    async fn peek_does_not_mutate_stats_or_access_count() {
        // Arrange
        let c = cache(CacheConfig::default());
        c.store("peekable prompt", "response", "gpt-4o", 1, 1).await;

        // Act
        c.peek("peekable prompt", "gpt-4o").await;
        let stats_after_peek = c.stats();

        // Assert
        assert_eq!(stats_after_peek.total_lookups, 0);
        assert_eq!(stats_after_peek.total_hits, 0);
    }

    #[tokio::test]
    async fn hydrate_twice_loads_nothing_new_the_second_time() {
        // Arrange
        let storage = Arc::new(InMemoryStorageAdapter::new());
        let c1 = ResponseCache::new(CacheConfig::default(), storage.clone(), Arc::new(NullEventSink));
        c1.store("persisted prompt", "persisted response", "gpt-4o", 1, 1).await;

        let c2 = ResponseCache::new(CacheConfig::default(), storage.clone(), Arc::new(NullEventSink));

        // Act
        c2.hydrate().await;
        let after_first = c2.stats().entries;
        c2.hydrate().await;
        let after_second = c2.stats().entries;

        // Assert
        assert_eq!(after_first, 1);
        assert_eq!(after_second, 1);
    }

    #[test]
    fn classify_content_type_prefers_time_sensitive_over_factual_shape() {
        // Act
        let ct = classify_content_type(&normalize("what is happening today"));

        // Assert
        assert_eq!(ct, ContentType::TimeSensitive);
    }

    #[test]
    fn cache_key_is_stable_and_prefixed() {
        // Act
        let k1 = ResponseCache::cache_key("Hello, World!", "gpt-4o");
        let k2 = ResponseCache::cache_key("hello world", "gpt-4o");

        // Assert
        assert_eq!(k1, k2);
        assert!(k1.starts_with("ts_"));
    }
}
