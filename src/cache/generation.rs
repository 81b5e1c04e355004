//! A single versioned cache container and the byte quota shared by all of them.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::RwLock;
use tracing::trace;

use super::{CacheKey, ResponseSnapshot, StoreError};

/// Byte budget shared by every generation of one store.
#[derive(Debug)]
pub(crate) struct Quota {
    limit: Option<usize>,
    used: AtomicUsize,
}

impl Quota {
    pub(crate) fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            used: AtomicUsize::new(0),
        }
    }

    pub(crate) fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Charges `bytes`, crediting `refund` first (the entry being replaced).
    fn reserve(&self, bytes: usize, refund: usize) -> Result<(), StoreError> {
        let Some(limit) = self.limit else {
            self.used.fetch_add(bytes, Ordering::AcqRel);
            self.release(refund);
            return Ok(());
        };
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                let after = used.saturating_sub(refund) + bytes;
                (after <= limit).then_some(after)
            })
            .map(|_| ())
            .map_err(|used| StoreError::QuotaExceeded {
                needed: bytes,
                available: limit.saturating_sub(used.saturating_sub(refund)),
            })
    }

    fn release(&self, bytes: usize) {
        // Saturating so a double release can never wrap the counter.
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(bytes))
            });
    }
}

struct Stored {
    snapshot: ResponseSnapshot,
    footprint: usize,
}

/// A named, versioned container of response snapshots.
///
/// At most one snapshot is held per [`CacheKey`]; a write always replaces the
/// prior entry. Once [`destroy`](Self::destroy)ed, a generation rejects all
/// writes and answers every lookup with a miss.
pub struct CacheGeneration {
    id: String,
    entries: RwLock<HashMap<CacheKey, Stored>>,
    quota: Arc<Quota>,
    destroyed: AtomicBool,
}

impl std::fmt::Debug for CacheGeneration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheGeneration")
            .field("id", &self.id)
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}

impl CacheGeneration {
    pub(crate) fn new(id: impl Into<String>, quota: Arc<Quota>) -> Self {
        Self {
            id: id.into(),
            entries: RwLock::new(HashMap::new()),
            quota,
            destroyed: AtomicBool::new(false),
        }
    }

    /// Returns the generation id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns `true` once the generation has been evicted.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Looks up the snapshot stored under `key`.
    pub async fn get(&self, key: &CacheKey) -> Option<ResponseSnapshot> {
        if self.is_destroyed() {
            return None;
        }
        self.entries
            .read()
            .await
            .get(key)
            .map(|stored| stored.snapshot.clone())
    }

    /// Returns `true` if an entry exists for `key`.
    pub async fn contains(&self, key: &CacheKey) -> bool {
        !self.is_destroyed() && self.entries.read().await.contains_key(key)
    }

    /// Stores `snapshot` under `key`, replacing any prior entry.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Destroyed`] if the generation was evicted meanwhile.
    /// - [`StoreError::QuotaExceeded`] if the write does not fit; the prior
    ///   entry, if any, is kept.
    pub async fn put(&self, key: CacheKey, snapshot: ResponseSnapshot) -> Result<(), StoreError> {
        self.put_all(vec![(key, snapshot)]).await
    }

    /// Stores every entry or none of them.
    pub async fn put_all(
        &self,
        batch: Vec<(CacheKey, ResponseSnapshot)>,
    ) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        // Checked under the write lock so a concurrent destroy cannot race the insert.
        if self.is_destroyed() {
            return Err(StoreError::Destroyed(self.id.clone()));
        }

        let mut batch_footprints = HashMap::with_capacity(batch.len());
        for (key, snapshot) in &batch {
            batch_footprints.insert(key, snapshot.footprint(key));
        }
        let needed: usize = batch_footprints.values().sum();
        let refund: usize = batch_footprints
            .keys()
            .filter_map(|key| entries.get(*key).map(|stored| stored.footprint))
            .sum();
        self.quota.reserve(needed, refund)?;

        for (key, snapshot) in batch {
            let footprint = snapshot.footprint(&key);
            trace!(generation = %self.id, key = %key, bytes = footprint, "entry stored");
            entries.insert(
                key,
                Stored {
                    snapshot,
                    footprint,
                },
            );
        }
        Ok(())
    }

    /// Removes the entry for `key`, returning whether one existed.
    pub async fn remove(&self, key: &CacheKey) -> bool {
        let removed = self.entries.write().await.remove(key);
        match removed {
            Some(stored) => {
                self.quota.release(stored.footprint);
                true
            }
            None => false,
        }
    }

    /// Returns every stored key, in no particular order.
    pub async fn keys(&self) -> Vec<CacheKey> {
        self.entries.read().await.keys().cloned().collect()
    }

    /// Returns the number of stored entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Returns `true` if nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Drops every entry and marks the generation dead. Idempotent.
    pub(crate) async fn destroy(&self) -> usize {
        let mut entries = self.entries.write().await;
        self.destroyed.store(true, Ordering::Release);
        let freed: usize = entries.values().map(|stored| stored.footprint).sum();
        let count = entries.len();
        entries.clear();
        self.quota.release(freed);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Method, Response, StatusCode};

    fn key(path: &str) -> CacheKey {
        CacheKey::new(Method::Get, format!("https://app.example{path}"))
    }

    fn snapshot(body: &str) -> ResponseSnapshot {
        ResponseSnapshot::capture(&Response::new(StatusCode::OK).body(body.to_owned())).unwrap()
    }

    fn generation(limit: Option<usize>) -> CacheGeneration {
        CacheGeneration::new("v1", Arc::new(Quota::new(limit)))
    }

    #[tokio::test]
    async fn write_replaces_prior_entry() {
        let generation = generation(None);
        generation.put(key("/a"), snapshot("old")).await.unwrap();
        generation.put(key("/a"), snapshot("new")).await.unwrap();
        assert_eq!(generation.len().await, 1);
        let got = generation.get(&key("/a")).await.unwrap();
        assert_eq!(got.body().as_ref(), b"new");
    }

    #[tokio::test]
    async fn replacement_refunds_quota() {
        let quota = Arc::new(Quota::new(None));
        let generation = CacheGeneration::new("v1", Arc::clone(&quota));
        generation.put(key("/a"), snapshot("aaaa")).await.unwrap();
        let first = quota.used();
        generation.put(key("/a"), snapshot("bb")).await.unwrap();
        assert_eq!(quota.used(), first - 2);
        generation.remove(&key("/a")).await;
        assert_eq!(quota.used(), 0);
    }

    #[tokio::test]
    async fn quota_rejects_write_and_keeps_prior_entry() {
        let k = key("/a");
        let small = snapshot("x");
        let limit = small.footprint(&k) + 2;
        let generation = generation(Some(limit));

        generation.put(k.clone(), small).await.unwrap();
        let err = generation.put(k.clone(), snapshot("xxxxxxxx")).await.unwrap_err();
        assert!(matches!(err, StoreError::QuotaExceeded { .. }));
        assert_eq!(generation.get(&k).await.unwrap().body().as_ref(), b"x");
    }

    #[tokio::test]
    async fn put_all_is_all_or_nothing() {
        let generation = generation(Some(60));
        let batch = vec![
            (key("/a"), snapshot("small")),
            (key("/b"), snapshot(&"y".repeat(100))),
        ];
        assert!(generation.put_all(batch).await.is_err());
        assert!(generation.is_empty().await);
    }

    #[tokio::test]
    async fn destroyed_generation_is_inert() {
        let quota = Arc::new(Quota::new(None));
        let generation = CacheGeneration::new("v1", Arc::clone(&quota));
        generation.put(key("/a"), snapshot("a")).await.unwrap();

        assert_eq!(generation.destroy().await, 1);
        assert_eq!(quota.used(), 0);
        assert!(generation.get(&key("/a")).await.is_none());
        assert!(matches!(
            generation.put(key("/b"), snapshot("b")).await,
            Err(StoreError::Destroyed(id)) if id == "v1"
        ));
        assert_eq!(generation.destroy().await, 0);
    }
}
