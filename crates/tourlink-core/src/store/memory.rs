//! In-memory coordination store
//!
//! Single-process implementation of [`CoordinationStore`] with TTL expiry
//! driven by a [`TimeSource`]. Expired entries read as absent and are evicted
//! lazily. Fault injection hooks let tests provoke write conflicts and outages.

use async_trait::async_trait;
use core::time::Duration;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::trace;

use super::{CasOutcome, CoordinationStore, Versioned};
use crate::errors::StoreError;
use crate::types::{SystemTimeSource, TimeSource, Timestamp};

#[derive(Debug, Clone)]
enum Value {
    Scalar(String),
    List(Vec<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    version: u64,
    expires_at: Timestamp,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    next_version: u64,
    injected_conflicts: u32,
    unavailable: bool,
    writes: u64,
}

impl Inner {
    fn live(&mut self, key: &str, now: Timestamp) -> Option<&mut Entry> {
        let expired = self
            .entries
            .get(key)
            .is_some_and(|entry| now >= entry.expires_at);
        if expired {
            trace!(key, "Evicting expired entry");
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn bump(&mut self) -> u64 {
        self.next_version += 1;
        self.writes += 1;
        self.next_version
    }
}

/// Process-local coordination store
#[derive(Debug)]
pub struct InMemoryStore<T: TimeSource = SystemTimeSource> {
    inner: Mutex<Inner>,
    time_source: T,
}

impl Default for InMemoryStore<SystemTimeSource> {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore<SystemTimeSource> {
    pub fn new() -> Self {
        Self::with_time_source(SystemTimeSource)
    }
}

impl<T: TimeSource> InMemoryStore<T> {
    pub fn with_time_source(time_source: T) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            time_source,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn guard(&self) -> Result<(MutexGuard<'_, Inner>, Timestamp), StoreError> {
        let inner = self.lock();
        if inner.unavailable {
            return Err(StoreError::Unavailable {
                reason: "store marked unavailable".into(),
            });
        }
        Ok((inner, self.time_source.now()))
    }

    // ------------------------------------------------------------------------
    // Fault Injection
    // ------------------------------------------------------------------------

    /// Make the next `count` compare-and-swap calls lose to a phantom writer
    pub fn inject_conflicts(&self, count: u32) {
        self.lock().injected_conflicts = count;
    }

    /// Fail every operation with [`StoreError::Unavailable`] while set
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Successful writes so far
    pub fn write_count(&self) -> u64 {
        self.lock().writes
    }

    /// Evict every expired entry; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = self.time_source.now();
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| now < entry.expires_at);
        before - inner.entries.len()
    }
}

#[async_trait]
impl<T: TimeSource> CoordinationStore for InMemoryStore<T> {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        let (mut inner, now) = self.guard()?;
        match inner.live(key, now) {
            Some(Entry {
                value: Value::Scalar(value),
                version,
                ..
            }) => Ok(Some(Versioned {
                value: value.clone(),
                version: *version,
            })),
            Some(_) => Err(StoreError::Corrupt {
                key: key.to_string(),
                reason: "list stored under scalar key".into(),
            }),
            None => Ok(None),
        }
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<u64, StoreError> {
        let (mut inner, now) = self.guard()?;
        let version = inner.bump();
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Scalar(value),
                version,
                expires_at: now + ttl,
            },
        );
        Ok(version)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_version: Option<u64>,
        value: String,
        ttl: Duration,
    ) -> Result<CasOutcome, StoreError> {
        let (mut inner, now) = self.guard()?;

        if inner.injected_conflicts > 0 {
            inner.injected_conflicts -= 1;
            // A phantom writer moved the version forward
            let phantom = inner.bump();
            if let Some(entry) = inner.live(key, now) {
                entry.version = phantom;
            }
            let current = inner.live(key, now).and_then(|entry| match &entry.value {
                Value::Scalar(value) => Some(Versioned {
                    value: value.clone(),
                    version: entry.version,
                }),
                Value::List(_) => None,
            });
            return Ok(CasOutcome::Conflict { current });
        }

        let current = inner.live(key, now).map(|entry| (entry.version, entry.value.clone()));
        let stored_version = current.as_ref().map(|(version, _)| *version);
        if stored_version != expected_version {
            let current = current.and_then(|(version, value)| match value {
                Value::Scalar(value) => Some(Versioned { value, version }),
                Value::List(_) => None,
            });
            return Ok(CasOutcome::Conflict { current });
        }

        let version = inner.bump();
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Scalar(value),
                version,
                expires_at: now + ttl,
            },
        );
        Ok(CasOutcome::Committed { version })
    }

    async fn list_append(
        &self,
        key: &str,
        item: String,
        ttl: Duration,
    ) -> Result<usize, StoreError> {
        let (mut inner, now) = self.guard()?;
        let version = inner.bump();
        let expires_at = now + ttl;
        let exists = inner.live(key, now).is_some();
        if !exists {
            inner.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::List(Vec::new()),
                    version,
                    expires_at,
                },
            );
        }
        let entry = inner
            .entries
            .get_mut(key)
            .ok_or_else(|| StoreError::Unavailable {
                reason: "list vanished during append".into(),
            })?;
        match &mut entry.value {
            Value::List(items) => {
                items.push(item);
                entry.version = version;
                entry.expires_at = expires_at;
                Ok(items.len())
            }
            Value::Scalar(_) => Err(StoreError::Corrupt {
                key: key.to_string(),
                reason: "scalar stored under list key".into(),
            }),
        }
    }

    async fn list_range(&self, key: &str, start: usize) -> Result<Vec<String>, StoreError> {
        let (mut inner, now) = self.guard()?;
        match inner.live(key, now) {
            Some(Entry {
                value: Value::List(items),
                ..
            }) => Ok(items.iter().skip(start).cloned().collect()),
            Some(_) => Err(StoreError::Corrupt {
                key: key.to_string(),
                reason: "scalar stored under list key".into(),
            }),
            None => Ok(Vec::new()),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let (mut inner, _) = self.guard()?;
        Ok(inner.entries.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ManualTimeSource;

    fn create_test_store() -> (InMemoryStore<ManualTimeSource>, ManualTimeSource) {
        let clock = ManualTimeSource::starting_at(1_000);
        (InMemoryStore::with_time_source(clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let (store, clock) = create_test_store();
        store
            .set_with_ttl("k", "v".into(), Duration::from_secs(10))
            .await
            .unwrap();
        clock.advance(Duration::from_millis(9_999));
        assert!(store.get("k").await.unwrap().is_some());
        clock.advance(Duration::from_millis(1));
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let (store, _) = create_test_store();
        let ttl = Duration::from_secs(60);

        let CasOutcome::Committed { version } = store
            .compare_and_swap("k", None, "a".into(), ttl)
            .await
            .unwrap()
        else {
            panic!("create should commit");
        };
        assert!(matches!(
            store.compare_and_swap("k", None, "b".into(), ttl).await.unwrap(),
            CasOutcome::Conflict { current: Some(ref v) } if v.value == "a"
        ));
        assert!(matches!(
            store
                .compare_and_swap("k", Some(version), "c".into(), ttl)
                .await
                .unwrap(),
            CasOutcome::Committed { .. }
        ));
        assert!(matches!(
            store
                .compare_and_swap("k", Some(version), "d".into(), ttl)
                .await
                .unwrap(),
            CasOutcome::Conflict { .. }
        ));
        assert_eq!(store.get("k").await.unwrap().unwrap().value, "c");
    }

    #[tokio::test]
    async fn test_injected_conflicts() {
        let (store, _) = create_test_store();
        let ttl = Duration::from_secs(60);
        store.inject_conflicts(1);
        assert!(matches!(
            store.compare_and_swap("k", None, "a".into(), ttl).await.unwrap(),
            CasOutcome::Conflict { current: None }
        ));
        assert!(matches!(
            store.compare_and_swap("k", None, "a".into(), ttl).await.unwrap(),
            CasOutcome::Committed { .. }
        ));
    }

    #[tokio::test]
    async fn test_list_append_and_range() {
        let (store, clock) = create_test_store();
        let ttl = Duration::from_secs(5);
        assert_eq!(store.list_append("l", "a".into(), ttl).await.unwrap(), 1);
        assert_eq!(store.list_append("l", "b".into(), ttl).await.unwrap(), 2);
        assert_eq!(store.list_range("l", 1).await.unwrap(), vec!["b".to_string()]);

        clock.advance(Duration::from_secs(5));
        assert!(store.list_range("l", 0).await.unwrap().is_empty());
        assert_eq!(store.purge_expired(), 0);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let (store, _) = create_test_store();
        store.set_unavailable(true);
        assert!(matches!(
            store.get("k").await,
            Err(StoreError::Unavailable { .. })
        ));
        store.set_unavailable(false);
        assert!(store.get("k").await.unwrap().is_none());
    }
}
