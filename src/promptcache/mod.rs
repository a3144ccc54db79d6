//! C5 — content-hashed, TTL'd prompt cache, per SPEC_FULL.md §4.5.
//!
//! The teacher has no dedicated prompt cache (only an embedding cache in
//! `services/embedding_service.rs`); this module generalizes that same
//! `Arc<RwLock<HashMap<...>>>` + TTL idiom to the spec's explicit
//! content-hash key and hit/miss accounting, using `sha2` (already a
//! teacher dependency) for the key.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};

const KEY_HEX_LEN: usize = 16;
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct PromptCacheEntry {
    pub hash: String,
    pub system_prompt: String,
    pub context: String,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub hit_count: u64,
    pub ttl: Duration,
}

impl PromptCacheEntry {
    fn is_expired(&self) -> bool {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::hours(24 * 365));
        Utc::now().signed_duration_since(self.last_used) > ttl
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheInfo {
    pub cache_hit: bool,
    pub cache_key: String,
    pub hit_count: u64,
    pub estimated_token_savings: usize,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct CacheStats {
    pub total_entries: usize,
    pub total_hits: u64,
}

/// Content-hashed prompt cache. `cache_system_prompt` / `cache_context`
/// independently gate whether each component feeds the hash, per the
/// `prompt_cache.py` cross-check recorded in SPEC_FULL.md §B4 — both
/// default true.
pub struct PromptCache {
    entries: DashMap<String, PromptCacheEntry>,
    ttl: Duration,
    cache_system_prompt: bool,
    cache_context: bool,
}

fn normalize(text: &str) -> String {
    text.trim().to_string()
}

impl PromptCache {
    pub fn new(ttl: Duration, cache_system_prompt: bool, cache_context: bool) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            cache_system_prompt,
            cache_context,
        }
    }

    fn cache_key(&self, system_prompt: &str, context: &str, provider: &str, model: &str) -> String {
        let mut hasher = Sha256::new();
        if self.cache_system_prompt {
            hasher.update(normalize(system_prompt).as_bytes());
        }
        hasher.update(b"\0");
        if self.cache_context {
            hasher.update(normalize(context).as_bytes());
        }
        hasher.update(b"\0");
        hasher.update(provider.to_lowercase().as_bytes());
        hasher.update(b"\0");
        hasher.update(model.to_lowercase().as_bytes());
        let digest = hasher.finalize();
        hex::encode(digest)[..KEY_HEX_LEN].to_string()
    }

    fn assemble(system_prompt: &str, context: &str) -> String {
        format!("{system_prompt}\n\nContext information is below.\n{context}\n\n")
    }

    /// Builds the cached portion of the prompt. On a live hit, refreshes
    /// `last_used` and increments `hit_count`; on miss (including an
    /// expired entry), inserts a fresh one. Expired entries are swept
    /// opportunistically on every call, per §4.5.
    pub fn build_optimized_prompt(
        &self,
        system_prompt: &str,
        context: &str,
        provider: &str,
        model: &str,
    ) -> (String, CacheInfo) {
        self.sweep_expired();
        let key = self.cache_key(system_prompt, context, provider, model);
        let assembled = Self::assemble(system_prompt, context);

        if let Some(mut entry) = self.entries.get_mut(&key) {
            if !entry.is_expired() {
                entry.last_used = Utc::now();
                entry.hit_count += 1;
                return (
                    assembled,
                    CacheInfo {
                        cache_hit: true,
                        cache_key: key,
                        hit_count: entry.hit_count,
                        estimated_token_savings: assembled.len() / 4,
                    },
                );
            }
        }

        let now = Utc::now();
        self.entries.insert(
            key.clone(),
            PromptCacheEntry {
                hash: key.clone(),
                system_prompt: system_prompt.to_string(),
                context: context.to_string(),
                created_at: now,
                last_used: now,
                hit_count: 0,
                ttl: self.ttl,
            },
        );

        (
            assembled,
            CacheInfo {
                cache_hit: false,
                cache_key: key,
                hit_count: 0,
                estimated_token_savings: 0,
            },
        )
    }

    fn sweep_expired(&self) {
        self.entries.retain(|_, entry| !entry.is_expired());
    }

    pub fn stats(&self) -> CacheStats {
        self.sweep_expired();
        CacheStats {
            total_entries: self.entries.len(),
            total_hits: self.entries.iter().map(|e| e.hit_count).sum(),
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_calls_are_byte_identical_and_increment_hit_count() {
        let cache = PromptCache::new(DEFAULT_TTL, true, true);
        let (first, info1) = cache.build_optimized_prompt("system", "context", "OpenAI", "gpt-4o");
        assert!(!info1.cache_hit);
        let (second, info2) = cache.build_optimized_prompt("system", "context", "OpenAI", "gpt-4o");
        assert_eq!(first, second);
        assert!(info2.cache_hit);
        assert_eq!(info2.hit_count, 1);
    }

    #[test]
    fn stats_reflect_single_hit_after_two_identical_calls() {
        let cache = PromptCache::new(DEFAULT_TTL, true, true);
        cache.build_optimized_prompt("s", "c", "anthropic", "claude");
        cache.build_optimized_prompt("s", "c", "anthropic", "claude");
        let stats = cache.stats();
        assert_eq!(stats.total_entries, 1);
        assert_eq!(stats.total_hits, 1);
    }

    #[test]
    fn expired_entry_is_treated_as_a_fresh_miss() {
        let cache = PromptCache::new(Duration::from_millis(1), true, true);
        cache.build_optimized_prompt("s", "c", "p", "m");
        std::thread::sleep(Duration::from_millis(20));
        let (_, info) = cache.build_optimized_prompt("s", "c", "p", "m");
        assert!(!info.cache_hit);
    }

    #[test]
    fn disabling_context_caching_ignores_context_in_the_key() {
        let cache = PromptCache::new(DEFAULT_TTL, true, false);
        let (_, info1) = cache.build_optimized_prompt("s", "context-a", "p", "m");
        let (_, info2) = cache.build_optimized_prompt("s", "context-b", "p", "m");
        assert_eq!(info1.cache_key, info2.cache_key);
        assert!(info2.cache_hit);
    }
}
