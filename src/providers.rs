//! # Provider store
//!
//! Maps content keys to the peers that advertised they can serve them.
//! Entries are written through to the host [`Datastore`] and cached in a
//! bounded LRU of content keys; evicting a key from the LRU deletes its
//! records, so the LRU is the store's memory bound, not just a cache.
//!
//! Expired entries are never returned: reads purge them lazily, and a
//! background sweep removes them in bulk so abandoned keys do not linger in
//! the datastore.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::DhtError;
use crate::host::Datastore;
use crate::keys::PeerId;

/// Providers kept per content key; the oldest entry is evicted beyond this.
pub const MAX_PROVIDERS_PER_KEY: usize = 10;

/// Distinct content keys kept in the store.
pub const MAX_PROVIDER_KEYS: usize = 256;

/// Age beyond which a provider record is dead.
pub const DEFAULT_PROVIDER_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Interval between background sweeps of expired records.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Keys examined per sweep batch before yielding to the scheduler.
const SWEEP_BATCH: usize = 64;

/// One advertisement: which peer, and when we heard it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct ProviderEntry {
    peer: PeerId,
    added_unix_secs: u64,
}

impl ProviderEntry {
    fn is_expired(&self, now: SystemTime, ttl: Duration) -> bool {
        let added = SystemTime::UNIX_EPOCH + Duration::from_secs(self.added_unix_secs);
        match now.duration_since(added) {
            Ok(age) => age >= ttl,
            // A record from the future is treated as fresh.
            Err(_) => false,
        }
    }
}

fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn datastore_key(cid: &[u8]) -> String {
    format!("/providers/{}", hex::encode(cid))
}

struct ProviderCache {
    keys: LruCache<Vec<u8>, Vec<ProviderEntry>>,
}

/// Bounded, TTL-expiring provider records backed by the host datastore.
pub struct ProviderStore {
    cache: Mutex<ProviderCache>,
    datastore: Arc<dyn Datastore>,
    ttl: Duration,
    max_per_key: usize,
}

impl ProviderStore {
    pub fn new(datastore: Arc<dyn Datastore>, ttl: Duration) -> Self {
        Self {
            cache: Mutex::new(ProviderCache {
                keys: LruCache::new(
                    NonZeroUsize::new(MAX_PROVIDER_KEYS).expect("cache bound is non-zero"),
                ),
            }),
            datastore,
            ttl,
            max_per_key: MAX_PROVIDERS_PER_KEY,
        }
    }

    /// Record that `peer` provides `cid` as of `now`.
    ///
    /// Re-announcements refresh the timestamp. A full provider list evicts
    /// its oldest entry.
    pub async fn add_provider(
        &self,
        cid: &[u8],
        peer: PeerId,
        now: SystemTime,
    ) -> Result<(), DhtError> {
        let mut cache = self.cache.lock().await;
        let mut entries = self.load(&mut cache, cid).await?;

        match entries.iter_mut().find(|e| e.peer == peer) {
            Some(existing) => existing.added_unix_secs = unix_secs(now),
            None => {
                entries.push(ProviderEntry {
                    peer,
                    added_unix_secs: unix_secs(now),
                });
                if entries.len() > self.max_per_key {
                    // Drop the entry heard longest ago.
                    if let Some(oldest) = entries
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, e)| e.added_unix_secs)
                        .map(|(i, _)| i)
                    {
                        let dropped = entries.remove(oldest);
                        trace!(
                            cid = hex::encode(&cid[..cid.len().min(8)]),
                            peer = %dropped.peer,
                            "provider list full, dropped oldest"
                        );
                    }
                }
            }
        }

        self.persist(&mut cache, cid, entries).await
    }

    /// Providers for `cid` younger than the TTL, freshest first. Expired
    /// entries found along the way are purged.
    pub async fn get_providers(
        &self,
        cid: &[u8],
        now: SystemTime,
    ) -> Result<Vec<PeerId>, DhtError> {
        let mut cache = self.cache.lock().await;
        let entries = self.load(&mut cache, cid).await?;
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let (mut live, expired): (Vec<_>, Vec<_>) = entries
            .into_iter()
            .partition(|e| !e.is_expired(now, self.ttl));
        if !expired.is_empty() {
            debug!(
                cid = hex::encode(&cid[..cid.len().min(8)]),
                purged = expired.len(),
                "purged expired provider records on read"
            );
            self.persist(&mut cache, cid, live.clone()).await?;
        }

        live.sort_by(|a, b| b.added_unix_secs.cmp(&a.added_unix_secs));
        Ok(live.into_iter().map(|e| e.peer).collect())
    }

    /// Remove expired entries across the whole datastore.
    pub async fn sweep(&self, now: SystemTime) -> Result<usize, DhtError> {
        let keys = self.datastore.list("/providers/").await?;
        let mut removed = 0usize;

        for (idx, ds_key) in keys.iter().enumerate() {
            let Some(blob) = self.datastore.get(ds_key).await? else {
                continue;
            };
            let Ok(entries) = bincode::deserialize::<Vec<ProviderEntry>>(&blob) else {
                warn!(key = %ds_key, "dropping undecodable provider blob");
                self.datastore.delete(ds_key).await?;
                continue;
            };

            let live: Vec<ProviderEntry> = entries
                .iter()
                .filter(|e| !e.is_expired(now, self.ttl))
                .cloned()
                .collect();
            if live.len() == entries.len() {
                continue;
            }
            removed += entries.len() - live.len();

            if live.is_empty() {
                self.datastore.delete(ds_key).await?;
            } else {
                let blob = bincode::serialize(&live)
                    .map_err(|e| DhtError::Datastore(e.to_string()))?;
                self.datastore.put(ds_key, blob).await?;
            }
            // The cache may hold the stale list; drop it and let the next
            // read repopulate.
            if let Some(cid) = ds_key
                .strip_prefix("/providers/")
                .and_then(|h| hex::decode(h).ok())
            {
                self.cache.lock().await.keys.pop(&cid);
            }

            if (idx + 1) % SWEEP_BATCH == 0 {
                tokio::task::yield_now().await;
            }
        }

        if removed > 0 {
            debug!(removed, "provider sweep removed expired records");
        }
        Ok(removed)
    }

    /// Run [`sweep`](Self::sweep) every `interval` until cancelled.
    pub fn spawn_sweep(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = store.sweep(SystemTime::now()).await {
                            warn!(error = %e, "provider sweep failed");
                        }
                    }
                }
            }
        })
    }

    async fn load(
        &self,
        cache: &mut ProviderCache,
        cid: &[u8],
    ) -> Result<Vec<ProviderEntry>, DhtError> {
        if let Some(entries) = cache.keys.get(cid) {
            return Ok(entries.clone());
        }
        let entries = match self.datastore.get(&datastore_key(cid)).await? {
            Some(blob) => bincode::deserialize(&blob)
                .map_err(|e| DhtError::Datastore(e.to_string()))?,
            None => Vec::new(),
        };
        Ok(entries)
    }

    async fn persist(
        &self,
        cache: &mut ProviderCache,
        cid: &[u8],
        entries: Vec<ProviderEntry>,
    ) -> Result<(), DhtError> {
        let ds_key = datastore_key(cid);
        if entries.is_empty() {
            cache.keys.pop(cid);
            return self.datastore.delete(&ds_key).await;
        }

        let blob = bincode::serialize(&entries).map_err(|e| DhtError::Datastore(e.to_string()))?;
        self.datastore.put(&ds_key, blob).await?;

        // Keeping the LRU authoritative for the memory bound: a key pushed
        // out of the LRU takes its datastore records with it.
        if let Some((evicted_cid, _)) = cache.keys.push(cid.to_vec(), entries) {
            if evicted_cid != cid {
                self.datastore.delete(&datastore_key(&evicted_cid)).await?;
                debug!(
                    cid = hex::encode(&evicted_cid[..evicted_cid.len().min(8)]),
                    "provider key evicted by LRU bound"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryDatastore;

    fn store_with_ttl(ttl: Duration) -> ProviderStore {
        ProviderStore::new(Arc::new(MemoryDatastore::new()), ttl)
    }

    fn peer(seed: u8) -> PeerId {
        PeerId::from_bytes([seed; 32])
    }

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[tokio::test]
    async fn add_and_get_providers() {
        let store = store_with_ttl(DEFAULT_PROVIDER_TTL);
        store.add_provider(b"cid", peer(1), at(1000)).await.unwrap();
        store.add_provider(b"cid", peer(2), at(2000)).await.unwrap();

        let providers = store.get_providers(b"cid", at(3000)).await.unwrap();
        assert_eq!(providers, vec![peer(2), peer(1)]);
        assert!(store.get_providers(b"other", at(3000)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn per_key_cap_evicts_oldest() {
        let store = store_with_ttl(DEFAULT_PROVIDER_TTL);
        for i in 0..(MAX_PROVIDERS_PER_KEY as u64 + 1) {
            store
                .add_provider(b"cid", peer(i as u8), at(1000 + i))
                .await
                .unwrap();
        }

        let providers = store.get_providers(b"cid", at(5000)).await.unwrap();
        assert_eq!(providers.len(), MAX_PROVIDERS_PER_KEY);
        assert!(!providers.contains(&peer(0)), "oldest entry should be gone");
        assert!(providers.contains(&peer(MAX_PROVIDERS_PER_KEY as u8)));
    }

    #[tokio::test]
    async fn reannouncement_refreshes_timestamp() {
        let store = store_with_ttl(Duration::from_secs(100));
        store.add_provider(b"cid", peer(1), at(0)).await.unwrap();
        store.add_provider(b"cid", peer(1), at(90)).await.unwrap();

        // Without the refresh this read at t=120 would see an expired entry.
        let providers = store.get_providers(b"cid", at(120)).await.unwrap();
        assert_eq!(providers, vec![peer(1)]);
    }

    #[tokio::test]
    async fn expired_records_never_returned() {
        let store = store_with_ttl(Duration::from_secs(100));
        store.add_provider(b"cid", peer(1), at(0)).await.unwrap();
        store.add_provider(b"cid", peer(2), at(50)).await.unwrap();

        let providers = store.get_providers(b"cid", at(110)).await.unwrap();
        assert_eq!(providers, vec![peer(2)]);

        let providers = store.get_providers(b"cid", at(200)).await.unwrap();
        assert!(providers.is_empty());
    }

    #[tokio::test]
    async fn sweep_removes_expired_from_datastore() {
        let datastore = Arc::new(MemoryDatastore::new());
        let store = ProviderStore::new(datastore.clone(), Duration::from_secs(100));
        store.add_provider(b"dead", peer(1), at(0)).await.unwrap();
        store.add_provider(b"mixed", peer(2), at(0)).await.unwrap();
        store.add_provider(b"mixed", peer(3), at(500)).await.unwrap();

        let removed = store.sweep(at(550)).await.unwrap();
        assert_eq!(removed, 2);

        assert!(datastore.get(&datastore_key(b"dead")).await.unwrap().is_none());
        let providers = store.get_providers(b"mixed", at(560)).await.unwrap();
        assert_eq!(providers, vec![peer(3)]);
    }

    #[tokio::test]
    async fn lru_bound_drops_least_recent_key() {
        let store = store_with_ttl(DEFAULT_PROVIDER_TTL);
        for i in 0..(MAX_PROVIDER_KEYS as u64 + 1) {
            let cid = format!("cid-{i}").into_bytes();
            store.add_provider(&cid, peer(1), at(1000 + i)).await.unwrap();
        }

        // The first key was pushed out of the LRU, taking its records along.
        let providers = store.get_providers(b"cid-0", at(5000)).await.unwrap();
        assert!(providers.is_empty());
        let providers = store.get_providers(b"cid-1", at(5000)).await.unwrap();
        assert_eq!(providers, vec![peer(1)]);
    }
}
