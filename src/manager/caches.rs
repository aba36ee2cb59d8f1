//! Named cache folders shared across task runs.
//!
//! A cache folder is held by at most one writer, or by any number of
//! readers. When every instance of a name is busy a new one is created,
//! so a name can map to several cache folders.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::engine::{Engine, Volume};
use crate::error::EngineError;

struct CacheEntry {
    volume: Arc<dyn Volume>,
    writer: bool,
    readers: usize,
}

impl CacheEntry {
    fn is_idle(&self) -> bool {
        !self.writer && self.readers == 0
    }
}

/// Cache folders grouped by name.
pub struct CachePool {
    engine: Arc<dyn Engine>,
    caches: Mutex<HashMap<String, Vec<CacheEntry>>>,
}

impl CachePool {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            caches: Mutex::new(HashMap::new()),
        }
    }

    fn caches(&self) -> MutexGuard<'_, HashMap<String, Vec<CacheEntry>>> {
        self.caches.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Leases a cache folder called `name`.
    ///
    /// A mutable lease takes an idle instance, a read-only lease any instance
    /// without a writer. If none fits, a new cache folder is created.
    pub async fn acquire(self: &Arc<Self>, name: &str, mutable: bool) -> Result<CacheLease, EngineError> {
        if let Some(volume) = self.try_reuse(name, mutable) {
            debug!(cache = name, volume = volume.id(), mutable, "Reusing cache folder");
            return Ok(self.lease(name, volume, mutable));
        }

        let volume = self.engine.new_cache_folder().await?;
        info!(cache = name, volume = volume.id(), "Created cache folder");
        self.caches().entry(name.to_string()).or_default().push(CacheEntry {
            volume: Arc::clone(&volume),
            writer: mutable,
            readers: usize::from(!mutable),
        });
        Ok(self.lease(name, volume, mutable))
    }

    fn try_reuse(&self, name: &str, mutable: bool) -> Option<Arc<dyn Volume>> {
        let mut caches = self.caches();
        let entries = caches.get_mut(name)?;
        let entry = entries.iter_mut().find(|entry| {
            !entry.volume.is_disposed() && if mutable { entry.is_idle() } else { !entry.writer }
        })?;
        if mutable {
            entry.writer = true;
        } else {
            entry.readers += 1;
        }
        Some(Arc::clone(&entry.volume))
    }

    fn lease(self: &Arc<Self>, name: &str, volume: Arc<dyn Volume>, mutable: bool) -> CacheLease {
        CacheLease {
            pool: Arc::clone(self),
            name: name.to_string(),
            volume,
            mutable,
        }
    }

    fn release(&self, name: &str, volume: &Arc<dyn Volume>, mutable: bool) {
        let mut caches = self.caches();
        let Some(entry) = caches
            .get_mut(name)
            .and_then(|entries| entries.iter_mut().find(|e| Arc::ptr_eq(&e.volume, volume)))
        else {
            return;
        };
        if mutable {
            entry.writer = false;
        } else {
            entry.readers = entry.readers.saturating_sub(1);
        }
        debug!(cache = name, volume = volume.id(), mutable, "Released cache folder");
    }

    /// Disposes idle instances of `name`. Leased instances are kept.
    ///
    /// Returns the number of instances disposed.
    pub async fn purge(&self, name: &str) -> Result<usize, EngineError> {
        let idle: Vec<Arc<dyn Volume>> = {
            let mut caches = self.caches();
            let Some(entries) = caches.get_mut(name) else {
                return Ok(0);
            };
            let (idle, busy): (Vec<_>, Vec<_>) = entries.drain(..).partition(CacheEntry::is_idle);
            *entries = busy;
            if entries.is_empty() {
                caches.remove(name);
            }
            idle.into_iter().map(|entry| entry.volume).collect()
        };

        let count = idle.len();
        for volume in idle {
            volume.dispose().await?;
        }
        if count > 0 {
            info!(cache = name, count, "Purged cache folders");
        }
        Ok(count)
    }

    /// Disposes every cache folder, leased or not.
    pub async fn dispose_all(&self) -> Result<(), EngineError> {
        let volumes: Vec<(String, Arc<dyn Volume>)> = self
            .caches()
            .drain()
            .flat_map(|(name, entries)| {
                entries
                    .into_iter()
                    .map(move |entry| (name.clone(), entry.volume))
            })
            .collect();

        let mut first_error = None;
        for (name, volume) in volumes {
            if let Err(e) = volume.dispose().await {
                warn!(cache = %name, volume = volume.id(), error = %e, "Failed to dispose cache folder");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Number of cache folders known under `name`.
    pub fn instances(&self, name: &str) -> usize {
        self.caches().get(name).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.caches().is_empty()
    }
}

/// A leased cache folder. Returned to the pool on drop.
pub struct CacheLease {
    pool: Arc<CachePool>,
    name: String,
    volume: Arc<dyn Volume>,
    mutable: bool,
}

impl CacheLease {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn volume(&self) -> Arc<dyn Volume> {
        Arc::clone(&self.volume)
    }

    pub fn is_mutable(&self) -> bool {
        self.mutable
    }
}

impl Drop for CacheLease {
    fn drop(&mut self) {
        self.pool.release(&self.name, &self.volume, self.mutable);
    }
}
