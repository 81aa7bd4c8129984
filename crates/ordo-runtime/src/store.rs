//! In-memory [`KVStore`] implementation.
//!
//! Backs tests and single-process deployments. TTLs are evaluated lazily
//! against an injected [`Clock`], so expiry is deterministic under a manual
//! clock. All mutating operations, including compare-and-swap, run under a
//! single write lock, which gives the atomicity the trait requires.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use ordo_kernel::capabilities::{CasOutcome, KVStore};
use ordo_kernel::clock::Clock;
use ordo_kernel::error::OrdoResult;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at_ms: Option<u64>,
}

impl Entry {
    fn live(&self, now_ms: u64) -> bool {
        self.expires_at_ms.map(|at| now_ms < at).unwrap_or(true)
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    zsets: HashMap<String, HashMap<String, f64>>,
}

/// Single-process [`KVStore`] over a `HashMap` behind one `RwLock`.
pub struct InMemoryKVStore {
    inner: RwLock<Inner>,
    clock: Arc<dyn Clock>,
}

impl InMemoryKVStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            clock,
        }
    }

    fn deadline(&self, ttl: Option<Duration>) -> Option<u64> {
        ttl.map(|t| self.clock.now_millis() + t.as_millis() as u64)
    }

    /// Glob match supporting `*` wildcards only.
    fn glob_match(pattern: &str, key: &str) -> bool {
        let parts: Vec<&str> = pattern.split('*').collect();
        if parts.len() == 1 {
            return pattern == key;
        }
        let mut rest = key;
        for (i, part) in parts.iter().enumerate() {
            if part.is_empty() {
                continue;
            }
            if i == 0 {
                match rest.strip_prefix(part) {
                    Some(r) => rest = r,
                    None => return false,
                }
            } else if i == parts.len() - 1 {
                return rest.ends_with(part);
            } else {
                match rest.find(part) {
                    Some(pos) => rest = &rest[pos + part.len()..],
                    None => return false,
                }
            }
        }
        true
    }
}

#[async_trait]
impl KVStore for InMemoryKVStore {
    async fn get(&self, key: &str) -> OrdoResult<Option<String>> {
        let now = self.clock.now_millis();
        let inner = self.inner.read().await;
        Ok(inner
            .entries
            .get(key)
            .filter(|e| e.live(now))
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> OrdoResult<()> {
        let expires_at_ms = self.deadline(ttl);
        let mut inner = self.inner.write().await;
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at_ms,
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> OrdoResult<bool> {
        let now = self.clock.now_millis();
        let expires_at_ms = self.deadline(ttl);
        let mut inner = self.inner.write().await;
        if inner.entries.get(key).map(|e| e.live(now)).unwrap_or(false) {
            return Ok(false);
        }
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at_ms,
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> OrdoResult<bool> {
        let mut inner = self.inner.write().await;
        Ok(inner.entries.remove(key).is_some())
    }

    async fn del_if_equals(&self, key: &str, expected: &str) -> OrdoResult<bool> {
        let now = self.clock.now_millis();
        let mut inner = self.inner.write().await;
        let matches = inner
            .entries
            .get(key)
            .map(|e| e.live(now) && e.value == expected)
            .unwrap_or(false);
        if matches {
            inner.entries.remove(key);
        }
        Ok(matches)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> OrdoResult<bool> {
        let now = self.clock.now_millis();
        let deadline = now + ttl.as_millis() as u64;
        let mut inner = self.inner.write().await;
        match inner.entries.get_mut(key) {
            Some(e) if e.live(now) => {
                e.expires_at_ms = Some(deadline);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn incr(&self, key: &str) -> OrdoResult<i64> {
        let now = self.clock.now_millis();
        let mut inner = self.inner.write().await;
        let current = inner
            .entries
            .get(key)
            .filter(|e| e.live(now))
            .and_then(|e| e.value.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + 1;
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at_ms: None,
            },
        );
        Ok(next)
    }

    async fn scan(&self, pattern: &str, count: usize) -> OrdoResult<Vec<String>> {
        let now = self.clock.now_millis();
        let inner = self.inner.read().await;
        let mut keys: Vec<String> = inner
            .entries
            .iter()
            .filter(|(k, e)| e.live(now) && Self::glob_match(pattern, k))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys.truncate(count);
        Ok(keys)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> OrdoResult<()> {
        let mut inner = self.inner.write().await;
        inner
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> OrdoResult<Vec<(String, f64)>> {
        let inner = self.inner.read().await;
        let mut members: Vec<(String, f64)> = inner
            .zsets
            .get(key)
            .map(|z| {
                z.iter()
                    .filter(|&(_, &s)| s >= min && s <= max)
                    .map(|(m, &s)| (m.clone(), s))
                    .collect()
            })
            .unwrap_or_default();
        members.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal).then(a.0.cmp(&b.0)));
        members.truncate(limit);
        Ok(members)
    }

    async fn zrem(&self, key: &str, member: &str) -> OrdoResult<bool> {
        let mut inner = self.inner.write().await;
        Ok(inner
            .zsets
            .get_mut(key)
            .map(|z| z.remove(member).is_some())
            .unwrap_or(false))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> OrdoResult<CasOutcome> {
        let now = self.clock.now_millis();
        let expires_at_ms = self.deadline(ttl);
        let mut inner = self.inner.write().await;
        let current = inner
            .entries
            .get(key)
            .filter(|e| e.live(now))
            .map(|e| e.value.clone());

        match (expected, current) {
            (Some(_), None) => Ok(CasOutcome::NotFound),
            (Some(exp), Some(cur)) if cur != exp => Ok(CasOutcome::Conflict { current: cur }),
            (None, Some(cur)) => Ok(CasOutcome::Conflict { current: cur }),
            _ => {
                inner.entries.insert(
                    key.to_string(),
                    Entry {
                        value: value.to_string(),
                        expires_at_ms,
                    },
                );
                Ok(CasOutcome::Written)
            }
        }
    }
}
