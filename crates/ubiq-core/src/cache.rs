//! TTL- and size-bounded caches for dataset definitions and key records.
//!
//! One cache object per `Credentials`, configured at construction (never
//! latched from globals). Two storage policies:
//!
//! * plain: the cached record carries the unwrapped data key;
//! * store-encrypted (`key_caching.encrypt`): the cached record holds
//!   only the wrapped blob, and every read re-unwraps it. The stored
//!   entry never contains key material in the clear.
//!
//! Disabled modes are pass-through: no reads, no writes. Concurrent
//! misses may fetch twice; either insert wins and both carry equivalent
//! content, so nothing is corrupted.

use std::time::Duration;

use moka::sync::Cache;
use tracing::debug;
use zeroize::Zeroizing;

use crate::client::{DataKey, WrappedDataKey};
use crate::config::Configuration;
use crate::error::Result;
use crate::structured::Dataset;

const MAX_ENTRIES: u64 = 100;

/// Identifies a structured key. Everything that could change the answer
/// is part of the key, including the signing and crypto secrets, so two
/// credential sets sharing a process can never cross-pollinate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct StructuredKeyId {
    pub host: String,
    pub papi: String,
    pub sapi: String,
    pub srsa: String,
    pub dataset: String,
    /// `-1` denotes the server's "current" key.
    pub key_number: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct UnstructuredKeyId {
    pub papi: String,
    pub wrapped_data_key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct DatasetId {
    pub papi: String,
    pub name: String,
}

/// A cached key record. `unwrapped` is `None` under the store-encrypted
/// policy and always present otherwise.
#[derive(Clone)]
struct CachedKey {
    record: WrappedDataKey,
    unwrapped: Option<Zeroizing<Vec<u8>>>,
}

pub(crate) struct Caches {
    datasets: Option<Cache<DatasetId, Dataset>>,
    structured: Option<Cache<StructuredKeyId, CachedKey>>,
    unstructured: Option<Cache<UnstructuredKeyId, CachedKey>>,
    encrypt_at_rest: bool,
    verbose: bool,
}

fn build_cache<K, V>(ttl_seconds: u64) -> Cache<K, V>
where
    K: std::hash::Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    Cache::builder()
        .max_capacity(MAX_ENTRIES)
        .time_to_live(Duration::from_secs(ttl_seconds))
        .build()
}

impl Caches {
    pub fn new(config: &Configuration) -> Self {
        let ttl = config.key_caching.ttl_seconds;
        let structured_on = config.key_caching.structured;
        let unstructured_on = config.key_caching.unstructured;
        Caches {
            // dataset definitions ride the structured-cache switch
            datasets: structured_on.then(|| build_cache(ttl)),
            structured: structured_on.then(|| build_cache(ttl)),
            unstructured: unstructured_on.then(|| build_cache(ttl)),
            encrypt_at_rest: config.key_caching.encrypt,
            verbose: config.logging.verbose,
        }
    }

    pub fn dataset(
        &self,
        id: DatasetId,
        fetch: impl FnOnce() -> Result<Dataset>,
    ) -> Result<Dataset> {
        let Some(cache) = &self.datasets else {
            return fetch();
        };
        if let Some(hit) = cache.get(&id) {
            return Ok(hit);
        }
        if self.verbose {
            debug!(target: "ubiq::cache", dataset = %id.name, "dataset cache miss");
        }
        let dataset = fetch()?;
        cache.insert(id, dataset.clone());
        Ok(dataset)
    }

    /// Get-or-fetch a structured key. A fetched "current" key (`-1`) is
    /// stored under both `-1` and its real number, so the next current
    /// lookup and explicit lookups by number both hit.
    pub fn structured_key(
        &self,
        id: StructuredKeyId,
        fetch: impl FnOnce() -> Result<WrappedDataKey>,
    ) -> Result<DataKey> {
        let Some(cache) = &self.structured else {
            return fetch()?.unwrap_key(&id.srsa);
        };

        if let Some(hit) = cache.get(&id) {
            if self.verbose {
                debug!(target: "ubiq::cache", dataset = %id.dataset, key_number = id.key_number,
                       "structured key cache hit");
            }
            return self.materialize(hit, &id.srsa);
        }

        let record = fetch()?;
        // Validate the unwrap before caching anything; a record that
        // cannot be unwrapped is never stored.
        let key = record.unwrap_key(&id.srsa)?;
        let cached = self.to_cached(record, &key);

        if id.key_number == -1 {
            let real = StructuredKeyId {
                key_number: key.key_number,
                ..id.clone()
            };
            cache.insert(real, cached.clone());
        }
        cache.insert(id, cached);
        Ok(key)
    }

    /// Peek without fetching; used by the all-keys path to skip unwraps
    /// for numbers already cached in usable form.
    pub fn peek_structured_key(&self, id: &StructuredKeyId) -> Option<Result<DataKey>> {
        let cache = self.structured.as_ref()?;
        let hit = cache.get(id)?;
        Some(self.materialize(hit, &id.srsa))
    }

    /// Insert a record fetched out-of-band (all-keys responses).
    pub fn insert_structured_key(&self, id: StructuredKeyId, record: WrappedDataKey, key: &DataKey) {
        if let Some(cache) = &self.structured {
            cache.insert(id, self.to_cached(record, key));
        }
    }

    pub fn unstructured_key(
        &self,
        id: UnstructuredKeyId,
        srsa: &str,
        fetch: impl FnOnce() -> Result<WrappedDataKey>,
    ) -> Result<DataKey> {
        let Some(cache) = &self.unstructured else {
            // Cache disabled wins: nothing is stored and the
            // store-encrypted flag is irrelevant.
            return fetch()?.unwrap_key(srsa);
        };

        if let Some(hit) = cache.get(&id) {
            if self.verbose {
                debug!(target: "ubiq::cache", "unstructured key cache hit");
            }
            return self.materialize(hit, srsa);
        }

        let record = fetch()?;
        let key = record.unwrap_key(srsa)?;
        cache.insert(id, self.to_cached(record, &key));
        Ok(key)
    }

    /// Drop one dataset definition, or every definition when `name` is
    /// `None`. The next fetch goes back to the server.
    pub fn flush_dataset(&self, papi: &str, name: Option<&str>) {
        let Some(cache) = &self.datasets else {
            return;
        };
        match name {
            Some(name) => cache.invalidate(&DatasetId {
                papi: papi.to_string(),
                name: name.to_string(),
            }),
            None => cache.invalidate_all(),
        }
    }

    /// Drop a cached structured key (including the "current" slot when
    /// `key_number` is `-1`), or every key when `id` is `None`.
    pub fn flush_structured_key(&self, id: Option<&StructuredKeyId>) {
        let Some(cache) = &self.structured else {
            return;
        };
        match id {
            Some(id) => cache.invalidate(id),
            None => cache.invalidate_all(),
        }
    }

    fn to_cached(&self, record: WrappedDataKey, key: &DataKey) -> CachedKey {
        CachedKey {
            record,
            unwrapped: (!self.encrypt_at_rest).then(|| key.raw.clone()),
        }
    }

    /// Turn a cached entry into a usable key, re-unwrapping when the
    /// entry is stored encrypted. The stored copy stays wrapped.
    fn materialize(&self, hit: CachedKey, srsa: &str) -> Result<DataKey> {
        match hit.unwrapped {
            Some(raw) => Ok(DataKey {
                raw,
                key_number: hit.record.key_number,
                key_fingerprint: hit.record.key_fingerprint.clone(),
                encryption_session: hit.record.encryption_session.clone(),
            }),
            None => hit.record.unwrap_key(srsa),
        }
    }
}
