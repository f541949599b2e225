use super::Spawner;
use parking_lot::{Condvar, Mutex};
use slog_scope::{debug, info};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

struct Slot<S> {
    spawner: S,
    last_used: Instant,
}

pub struct SpawnerCache<K, S> {
    entries: Mutex<HashMap<K, Slot<S>>>,
    max_idle: Duration,
}

impl<K, S> SpawnerCache<K, S>
where
    K: Eq + Hash + Clone + Debug,
    S: Spawner,
{
    /// A `max_idle` of zero disables idle eviction, except for spawners
    /// that bring their own [`Spawner::max_idle_time`].
    pub fn new(max_idle: Duration) -> Self {
        SpawnerCache {
            entries: Mutex::new(HashMap::new()),
            max_idle,
        }
    }

    /// Looks up the spawner for `key`, creating it with `create` if
    /// there is none, marks it as used at `now` and runs `action` on it.
    pub fn lookup_or_insert_with<T, E>(
        &self,
        key: &K,
        now: Instant,
        create: impl FnOnce() -> Result<S, E>,
        action: impl FnOnce(&mut S) -> Result<T, E>,
    ) -> Result<T, E> {
        let mut entries = self.entries.lock();
        let slot = match entries.entry(key.clone()) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(vacant) => {
                debug!("creating spawner"; "key" => ?key);
                let spawner = create()?;
                vacant.insert(Slot {
                    spawner,
                    last_used: now,
                })
            }
        };
        slot.last_used = now;
        action(&mut slot.spawner)
    }

    /// Runs `action` on the spawner for `key` if there is one, without
    /// counting that as a use.
    pub fn with_existing<T>(&self, key: &K, action: impl FnOnce(&mut S) -> T) -> Option<T> {
        let mut entries = self.entries.lock();
        entries.get_mut(key).map(|slot| action(&mut slot.spawner))
    }

    /// Stops and removes the spawner for `key`. Returns whether there was one.
    pub fn evict(&self, key: &K) -> bool {
        let removed = self.entries.lock().remove(key);
        match removed {
            Some(mut entry) => {
                debug!("evicting spawner"; "key" => ?key);
                entry.spawner.shutdown();
                true
            }
            None => false,
        }
    }

    /// Stops and removes every spawner.
    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        for (key, mut entry) in entries.drain() {
            debug!("evicting spawner"; "key" => ?key);
            entry.spawner.shutdown();
        }
    }

    /// Stops and removes the spawners that were last used more than
    /// their idle time before `now`. Returns their keys.
    pub fn reap_idle(&self, now: Instant) -> Vec<K> {
        let mut entries = self.entries.lock();
        let idle: Vec<K> = entries
            .iter()
            .filter(|(_, entry)| {
                let max_idle = entry.spawner.max_idle_time().unwrap_or(self.max_idle);
                max_idle != Duration::from_secs(0)
                    && now.saturating_duration_since(entry.last_used) > max_idle
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in &idle {
            if let Some(mut entry) = entries.remove(key) {
                info!("stopping idle spawner"; "key" => ?key);
                entry.spawner.shutdown();
            }
        }
        idle
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries.lock().keys().cloned().collect()
    }
}

/// A background thread that periodically evicts idle spawners from a cache.
pub struct Reaper {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl Reaper {
    pub fn start<K, S>(cache: Arc<SpawnerCache<K, S>>, interval: Duration) -> std::io::Result<Reaper>
    where
        K: Eq + Hash + Clone + Debug + Send + 'static,
        S: Spawner + Send + 'static,
    {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = stop.clone();
        let handle = thread::Builder::new()
            .name("zk-reaper".to_string())
            .spawn(move || {
                let (stopped, wakeup) = &*signal;
                let mut stopped = stopped.lock();
                loop {
                    wakeup.wait_for(&mut stopped, interval);
                    if *stopped {
                        return;
                    }
                    let reaped = cache.reap_idle(Instant::now());
                    if !reaped.is_empty() {
                        debug!("reaped idle spawners"; "count" => reaped.len());
                    }
                }
            })?;
        Ok(Reaper {
            stop,
            handle: Some(handle),
        })
    }

    /// Stops the reaper thread and waits for it to finish.
    pub fn stop(&mut self) {
        let (stopped, wakeup) = &*self.stop;
        *stopped.lock() = true;
        wakeup.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.stop();
    }
}
