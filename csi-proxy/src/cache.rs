//! Connection cache
//!
//! Maps a connection name to a live backend built from
//! `<configFolder>/<name>.yaml` merged over the proxy's base options.
//!
//! Locking:
//! - the registry mutex guards the name -> entry map and each entry's
//!   eviction timer. It is never held across an await.
//! - each entry has its own async mutex serializing stat, reload and build
//!   for that name, so concurrent lookups construct at most once per config
//!   version while other names proceed independently.
//!
//! Timer reset and eviction both run under the registry mutex and compare a
//! generation counter, so an eviction that fires while a lookup touches the
//! entry cannot remove it. Eviction also skips an entry whose state lock is
//! held, and the timer restarts once the lookup finishes. An entry left
//! without a backend by a failed lookup is removed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::backend::Backend;
use crate::config::{self, DriverOptions};
use crate::error::Result;
use crate::factory::DriverFactory;
use crate::metrics;

/// How long connection entries live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Build a new backend on every lookup, never cache.
    AlwaysFresh,
    /// Keep entries until invalidated or the process exits.
    Permanent,
    /// Evict an entry after this long without lookups.
    IdleTimeout(Duration),
}

impl CachePolicy {
    /// `0` is always-fresh, negative is permanent.
    pub fn from_minutes(minutes: i64) -> Self {
        match minutes {
            0 => CachePolicy::AlwaysFresh,
            m if m < 0 => CachePolicy::Permanent,
            m => CachePolicy::IdleTimeout(Duration::from_secs(m.unsigned_abs() * 60)),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct EntryState {
    modified: Option<SystemTime>,
    backend: Option<Arc<dyn Backend>>,
}

#[derive(Default)]
struct Entry {
    state: tokio::sync::Mutex<EntryState>,
}

#[derive(Default)]
struct EvictionTimer {
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl EvictionTimer {
    fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct Slot {
    entry: Arc<Entry>,
    timer: EvictionTimer,
}

struct Inner {
    config_folder: PathBuf,
    base: DriverOptions,
    factory: DriverFactory,
    policy: CachePolicy,
    slots: Mutex<HashMap<String, Slot>>,
}

impl Inner {
    /// Get or create the entry for `name` and restart its idle timer.
    ///
    /// Returns the generation this lookup owns.
    fn checkout(self: &Arc<Self>, name: &str) -> (Arc<Entry>, u64) {
        let mut slots = lock(&self.slots);
        let slot = slots.entry(name.to_string()).or_insert_with(|| Slot {
            entry: Arc::new(Entry::default()),
            timer: EvictionTimer::default(),
        });

        slot.timer.generation += 1;
        self.arm(name, &mut slot.timer);

        let checkout = (slot.entry.clone(), slot.timer.generation);
        metrics::set_cached_connections(slots.len());
        checkout
    }

    fn arm(self: &Arc<Self>, name: &str, timer: &mut EvictionTimer) {
        timer.cancel();
        if let CachePolicy::IdleTimeout(idle) = self.policy {
            let inner = Arc::downgrade(self);
            let task = evict_after(inner, name.to_string(), timer.generation, idle);
            timer.task = Some(tokio::spawn(task));
        }
    }

    /// Finish the lookup that owns `generation`.
    ///
    /// An entry holding a backend gets a fresh idle timer. An entry left
    /// empty by a failed lookup is dropped. Both are skipped once a newer
    /// lookup has checked the entry out.
    fn release(self: &Arc<Self>, name: &str, generation: u64, loaded: bool) {
        let mut slots = lock(&self.slots);
        let Some(slot) = slots.get_mut(name) else {
            return;
        };
        if slot.timer.generation != generation {
            return;
        }

        if loaded {
            self.arm(name, &mut slot.timer);
        } else {
            slot.timer.cancel();
            slots.remove(name);
            metrics::set_cached_connections(slots.len());
            debug!(connection = %name, "Dropped entry after failed lookup");
        }
    }

    /// Remove `name` if nothing touched it since `generation` was issued and
    /// no lookup is loading it.
    fn evict(&self, name: &str, generation: u64) {
        let mut slots = lock(&self.slots);
        let idle = slots.get(name).is_some_and(|slot| {
            slot.timer.generation == generation && slot.entry.state.try_lock().is_ok()
        });
        if idle {
            slots.remove(name);
            metrics::record_eviction();
            metrics::set_cached_connections(slots.len());
            info!(connection = %name, "Evicted idle connection");
        }
    }

    async fn refresh(
        &self,
        name: &str,
        path: &Path,
        state: &mut EntryState,
    ) -> Result<Arc<dyn Backend>> {
        let modified = tokio::fs::metadata(path).await?.modified()?;
        if state.modified == Some(modified)
            && let Some(backend) = &state.backend
        {
            debug!(connection = %name, "Reusing cached backend");
            return Ok(backend.clone());
        }

        info!(
            connection = %name,
            path = %path.display(),
            rebuild = state.backend.is_some(),
            "Loading connection config"
        );
        let options = self.load_options(path).await?;
        let backend = self.factory.build(&options)?;

        state.backend = Some(backend.clone());
        state.modified = Some(modified);
        Ok(backend)
    }

    async fn load_options(&self, path: &Path) -> Result<DriverOptions> {
        let overlay = DriverOptions::load(path).await?;
        Ok(self.base.merged_with(overlay))
    }
}

async fn evict_after(inner: Weak<Inner>, name: String, generation: u64, idle: Duration) {
    tokio::time::sleep(idle).await;
    if let Some(inner) = inner.upgrade() {
        inner.evict(&name, generation);
    }
}

/// Registry of per-connection backends, refreshed when the connection file
/// changes.
#[derive(Clone)]
pub struct ConnectionCache {
    inner: Arc<Inner>,
}

impl ConnectionCache {
    pub fn new(
        config_folder: impl Into<PathBuf>,
        base: DriverOptions,
        factory: DriverFactory,
        policy: CachePolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config_folder: config_folder.into(),
                base,
                factory,
                policy,
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Configure from the `proxy` section of the base options.
    pub fn from_options(base: DriverOptions, factory: DriverFactory) -> Self {
        let folder = base.proxy.config_folder.clone();
        let policy = base.proxy.cache_policy();
        Self::new(folder, base, factory, policy)
    }

    pub fn policy(&self) -> CachePolicy {
        self.inner.policy
    }

    /// Backend for `connection`, rebuilt if its file changed since the last
    /// lookup.
    ///
    /// Stat, read, parse and build failures propagate and are not cached.
    pub async fn resolve(&self, connection: &str) -> Result<Arc<dyn Backend>> {
        let path = config::connection_path(&self.inner.config_folder, connection)?;

        if self.inner.policy == CachePolicy::AlwaysFresh {
            debug!(connection = %connection, "Cache disabled, building fresh backend");
            let options = self.inner.load_options(&path).await?;
            return self.inner.factory.build(&options);
        }

        let (entry, generation) = self.inner.checkout(connection);
        let mut state = entry.state.lock().await;
        let result = self.inner.refresh(connection, &path, &mut state).await;
        self.inner.release(connection, generation, state.backend.is_some());
        result
    }

    /// Drop the entry for `connection`. Returns whether one existed.
    pub fn invalidate(&self, connection: &str) -> bool {
        let mut slots = lock(&self.inner.slots);
        match slots.remove(connection) {
            Some(mut slot) => {
                slot.timer.cancel();
                metrics::set_cached_connections(slots.len());
                info!(connection = %connection, "Invalidated connection");
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, connection: &str) -> bool {
        lock(&self.inner.slots).contains_key(connection)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Node-side backends keyed by kind.
///
/// Node configuration is static for the process lifetime, so entries are
/// never refreshed or evicted.
pub struct KindCache {
    base: DriverOptions,
    factory: DriverFactory,
    backends: Mutex<HashMap<String, Arc<dyn Backend>>>,
}

impl KindCache {
    pub fn new(base: DriverOptions, factory: DriverFactory) -> Self {
        Self {
            base,
            factory,
            backends: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, kind: &str) -> Result<Arc<dyn Backend>> {
        let mut backends = lock(&self.backends);
        if let Some(backend) = backends.get(kind) {
            return Ok(backend.clone());
        }

        let backend = self.factory.build(&self.base.with_driver(kind))?;
        backends.insert(kind.to_string(), backend.clone());
        Ok(backend)
    }

    pub fn len(&self) -> usize {
        lock(&self.backends).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
