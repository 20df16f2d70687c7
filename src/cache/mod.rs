//! Analysis cache.
//!
//! Results are keyed by `sha256(content):kind:fingerprint`, so the same
//! source text analyzed with the same parameters hits the same entry no
//! matter which path or commit it came from. Redis is used when configured
//! and reachable; any Redis failure flips the cache into memory mode for the
//! rest of the process. Cache operations never fail the caller.

pub mod memory;
pub mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use crate::config::{CacheConfig, CacheTtlConfig};
use crate::error::CacheError;
use crate::models::{AnalysisCandidate, AnalysisKind, CachedAnalysis, ConsensusMethod};
use crate::providers::prompt::PROMPT_VERSION;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Parameters that change what an analysis returns for the same source.
#[derive(Debug, Clone, Copy)]
pub struct KeyParams<'a> {
    pub method: ConsensusMethod,
    pub pinned_provider: Option<&'a str>,
    pub provider_ids: &'a [String],
}

/// Short stable hash of the parameters.
pub fn fingerprint(params: &KeyParams<'_>) -> String {
    let mut providers: Vec<&str> = params.provider_ids.iter().map(String::as_str).collect();
    providers.sort_unstable();

    let mut hasher = Sha256::new();
    hasher.update(PROMPT_VERSION.as_bytes());
    hasher.update(b"\0");
    hasher.update(params.method.as_str().as_bytes());
    hasher.update(b"\0");
    hasher.update(params.pinned_provider.unwrap_or("*").as_bytes());
    for id in providers {
        hasher.update(b"\0");
        hasher.update(id.as_bytes());
    }
    hex::encode(hasher.finalize())[..16].to_string()
}

pub fn cache_key(
    candidate: &AnalysisCandidate,
    kind: AnalysisKind,
    params: &KeyParams<'_>,
) -> String {
    format!("{}:{}:{}", candidate.content_digest(), kind, fingerprint(params))
}

pub fn kind_tag(kind: AnalysisKind) -> String {
    format!("kind:{}", kind)
}

pub fn language_tag(language: &str) -> String {
    format!("lang:{}", language.to_lowercase())
}

pub fn provider_tag(provider_id: &str) -> String {
    format!("provider:{}", provider_id)
}

/// Key/value cache with per-kind TTLs and tag invalidation.
pub struct AnalysisCache {
    redis: Option<RedisStore>,
    memory: MemoryStore,
    degraded: AtomicBool,
    ttl: CacheTtlConfig,
}

impl AnalysisCache {
    /// Connect to Redis if configured, otherwise run in memory.
    pub async fn connect(config: &CacheConfig) -> Self {
        let redis = match config.redis_url.as_deref() {
            Some(url) => {
                let connect_timeout = Duration::from_millis(config.connect_timeout_ms);
                match RedisStore::connect(url, connect_timeout).await {
                    Ok(store) => {
                        info!("Analysis cache backed by Redis");
                        Some(store)
                    }
                    Err(e) => {
                        warn!("Redis unavailable ({}), using in-process cache", e);
                        None
                    }
                }
            }
            None => {
                debug!("No Redis URL configured, using in-process cache");
                None
            }
        };

        Self {
            redis,
            memory: MemoryStore::new(config.max_memory_entries),
            degraded: AtomicBool::new(false),
            ttl: config.ttl.clone(),
        }
    }

    pub fn memory_only(config: &CacheConfig) -> Self {
        Self {
            redis: None,
            memory: MemoryStore::new(config.max_memory_entries),
            degraded: AtomicBool::new(false),
            ttl: config.ttl.clone(),
        }
    }

    /// Healthy Redis backend, if any.
    fn shared(&self) -> Option<&RedisStore> {
        if self.degraded.load(Ordering::Relaxed) {
            None
        } else {
            self.redis.as_ref()
        }
    }

    fn degrade(&self, err: &CacheError) {
        if !self.degraded.swap(true, Ordering::Relaxed) {
            warn!("Redis cache failed ({}), falling back to in-process cache", err);
        }
    }

    pub fn backend_name(&self) -> &'static str {
        if self.shared().is_some() {
            "redis"
        } else {
            "memory"
        }
    }

    pub fn ttl_for(&self, kind: AnalysisKind) -> Duration {
        self.ttl.for_kind(kind)
    }

    pub async fn get(&self, key: &str) -> Option<CachedAnalysis> {
        let raw = match self.shared() {
            Some(redis) => match redis.get(key).await {
                Ok(raw) => raw,
                Err(e) => {
                    self.degrade(&e);
                    self.memory.get(key)
                }
            },
            None => self.memory.get(key),
        }?;

        match serde_json::from_str(&raw) {
            Ok(value) => {
                debug!(key, "Cache hit");
                Some(value)
            }
            Err(e) => {
                warn!(key, "Discarding undecodable cache entry: {}", e);
                None
            }
        }
    }

    pub async fn set(
        &self,
        key: &str,
        value: &CachedAnalysis,
        kind: AnalysisKind,
        tags: &[String],
    ) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key, "Not caching result: {}", CacheError::from(e));
                return;
            }
        };
        let ttl = self.ttl_for(kind);

        if let Some(redis) = self.shared() {
            match redis.set(key, &raw, ttl, tags).await {
                Ok(()) => return,
                Err(e) => self.degrade(&e),
            }
        }
        self.memory.set(key, raw, ttl, tags);
    }

    /// Drop every entry carrying `tag`; returns how many were removed.
    pub async fn invalidate(&self, tag: &str) -> usize {
        let mut removed = self.memory.invalidate(tag);
        if let Some(redis) = self.shared() {
            match redis.invalidate(tag).await {
                Ok(n) => removed += n,
                Err(e) => self.degrade(&e),
            }
        }
        info!(tag, removed, "Invalidated cache entries");
        removed
    }
}
