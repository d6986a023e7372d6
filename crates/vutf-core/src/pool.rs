//! OrchestratorPool - bounded, expiring cache of orchestrator instances.
//!
//! Entries are keyed by [`OrchestratorConfig::cache_key`]. A hit younger
//! than the TTL is returned as-is (and marked recently used); a miss or an
//! expired hit calls the supplied constructor. Creation for one key is
//! serialized with a per-key async lock and a second check under that lock,
//! so concurrent callers with the same config share one instance and one
//! store handle.
//!
//! Every entry owns one reference on its instance's store handle; removing
//! an entry for any reason hands that reference back to the
//! [`ConnectionManager`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::connection::ConnectionManager;
use crate::error::{Error, Result};
use crate::orchestrator::{OrchestratorConfig, OrchestratorInstance};

struct PoolEntry {
    instance: Arc<OrchestratorInstance>,
    /// Monotonic use counter; higher is more recent
    last_used: u64,
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<String, PoolEntry>,
    keys_by_id: HashMap<Uuid, String>,
}

impl PoolState {
    fn remove(&mut self, key: &str) -> Option<Arc<OrchestratorInstance>> {
        let entry = self.entries.remove(key)?;
        self.keys_by_id.remove(&entry.instance.id());
        Some(entry.instance)
    }

    fn least_recently_used(&self) -> Option<String> {
        self.entries
            .iter()
            .min_by_key(|(_, e)| e.last_used)
            .map(|(k, _)| k.clone())
    }
}

/// Point-in-time pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub created: usize,
    pub hits: usize,
    pub evicted: usize,
}

/// Cache of orchestrator instances bounded by size and age
pub struct OrchestratorPool {
    config: PoolConfig,
    connections: Arc<ConnectionManager>,
    state: Mutex<PoolState>,
    creation_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    clock: AtomicU64,
    created: AtomicUsize,
    hits: AtomicUsize,
    evicted: AtomicUsize,
}

impl OrchestratorPool {
    pub fn new(config: PoolConfig, connections: Arc<ConnectionManager>) -> Self {
        Self {
            config,
            connections,
            state: Mutex::new(PoolState::default()),
            creation_locks: Mutex::new(HashMap::new()),
            clock: AtomicU64::new(0),
            created: AtomicUsize::new(0),
            hits: AtomicUsize::new(0),
            evicted: AtomicUsize::new(0),
        }
    }

    /// Return the live instance for `config`, or build one with `create_fn`.
    ///
    /// `create_fn` is expected to acquire the user's store handle; its
    /// reference then belongs to the pool.
    pub async fn get_or_create<F, Fut>(
        &self,
        config: &OrchestratorConfig,
        create_fn: F,
    ) -> Result<Arc<OrchestratorInstance>>
    where
        F: FnOnce(OrchestratorConfig) -> Fut,
        Fut: Future<Output = Result<OrchestratorInstance>>,
    {
        let key = config.cache_key()?;

        if let Some(instance) = self.lookup_fresh(&key)? {
            return Ok(instance);
        }

        let lock = self.creation_lock(&key)?;
        let result = {
            let _guard = lock.lock().await;
            self.create_locked(key.clone(), config, create_fn).await
        };
        drop(lock);
        self.prune_creation_lock(&key);
        result
    }

    /// Second check and creation, with the key's creation lock held
    async fn create_locked<F, Fut>(
        &self,
        key: String,
        config: &OrchestratorConfig,
        create_fn: F,
    ) -> Result<Arc<OrchestratorInstance>>
    where
        F: FnOnce(OrchestratorConfig) -> Fut,
        Fut: Future<Output = Result<OrchestratorInstance>>,
    {
        // Another caller may have created it while we waited.
        if let Some(instance) = self.lookup_fresh(&key)? {
            return Ok(instance);
        }

        let stale = {
            let mut state = self.state.lock().map_err(|_| Error::LockPoisoned)?;
            state.remove(&key)
        };
        if let Some(stale) = stale {
            info!(orchestrator_id = %stale.id(), "Orchestrator expired, recreating");
            self.retire(&stale);
        }

        let instance = Arc::new(create_fn(config.clone()).await?);
        self.created.fetch_add(1, Ordering::SeqCst);

        let evicted = {
            let mut state = self.state.lock().map_err(|_| Error::LockPoisoned)?;
            state.keys_by_id.insert(instance.id(), key.clone());
            state.entries.insert(
                key,
                PoolEntry {
                    instance: Arc::clone(&instance),
                    last_used: self.tick(),
                },
            );

            let mut evicted = Vec::new();
            while state.entries.len() > self.config.max_instances {
                let Some(lru) = state.least_recently_used() else {
                    break;
                };
                if let Some(old) = state.remove(&lru) {
                    evicted.push(old);
                }
            }
            evicted
        };

        for old in &evicted {
            info!(orchestrator_id = %old.id(), "Evicting least recently used orchestrator");
            self.retire(old);
        }

        info!(
            orchestrator_id = %instance.id(),
            orchestrator_type = %instance.config().orchestrator_type,
            user = %instance.config().user,
            "Created orchestrator"
        );
        Ok(instance)
    }

    /// Instance by id, if pooled and not expired
    pub fn get(&self, id: Uuid) -> Result<Option<Arc<OrchestratorInstance>>> {
        let key = {
            let state = self.state.lock().map_err(|_| Error::LockPoisoned)?;
            state.keys_by_id.get(&id).cloned()
        };
        match key {
            Some(key) => self.lookup_fresh(&key),
            None => Ok(None),
        }
    }

    /// Evict expired entries. Returns how many were removed.
    pub fn clear_expired(&self) -> Result<usize> {
        let expired: Vec<Arc<OrchestratorInstance>> = {
            let mut state = self.state.lock().map_err(|_| Error::LockPoisoned)?;
            let keys: Vec<String> = state
                .entries
                .iter()
                .filter(|(_, e)| e.instance.age() >= self.config.ttl())
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter().filter_map(|k| state.remove(k)).collect()
        };

        for instance in &expired {
            debug!(orchestrator_id = %instance.id(), "Orchestrator TTL expired");
            self.retire(instance);
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "Cleared expired orchestrators");
        }
        Ok(expired.len())
    }

    /// Remove one instance. Returns false if it was not pooled.
    pub fn remove(&self, id: Uuid) -> Result<bool> {
        let removed = {
            let mut state = self.state.lock().map_err(|_| Error::LockPoisoned)?;
            match state.keys_by_id.get(&id).cloned() {
                Some(key) => state.remove(&key),
                None => None,
            }
        };
        match removed {
            Some(instance) => {
                self.retire(&instance);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove every instance
    pub fn clear(&self) -> Result<usize> {
        let all: Vec<Arc<OrchestratorInstance>> = {
            let mut state = self.state.lock().map_err(|_| Error::LockPoisoned)?;
            state.keys_by_id.clear();
            state.entries.drain().map(|(_, e)| e.instance).collect()
        };
        for instance in &all {
            self.retire(instance);
        }
        Ok(all.len())
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.len(),
            created: self.created.load(Ordering::SeqCst),
            hits: self.hits.load(Ordering::SeqCst),
            evicted: self.evicted.load(Ordering::SeqCst),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn lookup_fresh(&self, key: &str) -> Result<Option<Arc<OrchestratorInstance>>> {
        let mut state = self.state.lock().map_err(|_| Error::LockPoisoned)?;
        let ttl = self.config.ttl();
        let tick = self.tick();
        match state.entries.get_mut(key) {
            Some(entry) if entry.instance.age() < ttl => {
                entry.last_used = tick;
                entry.instance.touch();
                self.hits.fetch_add(1, Ordering::SeqCst);
                Ok(Some(Arc::clone(&entry.instance)))
            }
            _ => Ok(None),
        }
    }

    fn creation_lock(&self, key: &str) -> Result<Arc<AsyncMutex<()>>> {
        let mut locks = self.creation_locks.lock().map_err(|_| Error::LockPoisoned)?;
        Ok(Arc::clone(locks.entry(key.to_string()).or_default()))
    }

    /// Drop the key's lock once no other caller holds or waits on it
    fn prune_creation_lock(&self, key: &str) {
        if let Ok(mut locks) = self.creation_locks.lock() {
            if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
                locks.remove(key);
            }
        }
    }

    /// Keys with a live creation lock
    pub fn pending_creations(&self) -> usize {
        self.creation_locks.lock().map(|l| l.len()).unwrap_or(0)
    }

    fn retire(&self, instance: &OrchestratorInstance) {
        self.evicted.fetch_add(1, Ordering::SeqCst);
        self.connections.release(instance.memory_handle());
    }
}
