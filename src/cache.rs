pub mod persistent;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use persistent::{SnapshotRow, SnapshotStore};

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: u64,
}

impl<V> CacheEntry<V> {
    fn is_live(&self, now: u64) -> bool {
        self.expires_at == 0 || self.expires_at > now
    }
}

#[derive(Debug)]
struct Store<V> {
    entries: RwLock<HashMap<String, CacheEntry<V>>>,
}

impl<V> Store<V> {
    fn sweep(&self, now: u64) -> usize {
        let mut entries = self.entries.write().expect("cache lock poisoned");
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }
}

#[derive(Debug)]
struct Sweeper {
    stop: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        let _ = self.stop.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Concurrent key/value cache with per-entry expiry.
///
/// Expired entries disappear lazily on read and, when a sweep interval is
/// given, from a background thread that stops when the cache is dropped.
#[derive(Debug)]
pub struct TtlCache<V> {
    store: Arc<Store<V>>,
    snapshot: Option<SnapshotStore>,
    _sweeper: Option<Sweeper>,
}

impl<V: Clone + Send + Sync + 'static> TtlCache<V> {
    pub fn new() -> Self {
        Self {
            store: Arc::new(Store {
                entries: RwLock::new(HashMap::new()),
            }),
            snapshot: None,
            _sweeper: None,
        }
    }

    pub fn with_sweep(interval: Duration) -> Self {
        let mut cache = Self::new();
        cache._sweeper = spawn_sweeper(Arc::downgrade(&cache.store), interval);
        cache
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let now = now_millis();
        {
            let entries = self.store.entries.read().expect("cache lock poisoned");
            match entries.get(key) {
                Some(entry) if entry.is_live(now) => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        self.remove_if_expired(key, now);
        None
    }

    // Stores `value` under `key`; a zero `ttl` never expires.
    pub fn put(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let expires_at = if ttl.is_zero() {
            0
        } else {
            now_millis().saturating_add(ttl.as_millis() as u64).max(1)
        };
        self.store
            .entries
            .write()
            .expect("cache lock poisoned")
            .insert(key.into(), CacheEntry { value, expires_at });
    }

    pub fn invalidate(&self, key: &str) {
        self.store
            .entries
            .write()
            .expect("cache lock poisoned")
            .remove(key);
    }

    pub fn invalidate_all(&self) {
        self.store
            .entries
            .write()
            .expect("cache lock poisoned")
            .clear();
    }

    pub fn invalidate_pattern(&self, pattern: &str) -> usize {
        let matcher = match glob_to_regex(pattern) {
            Ok(matcher) => matcher,
            Err(err) => {
                warn!(pattern, error = %err, "unusable invalidation pattern");
                return 0;
            }
        };
        let mut entries = self.store.entries.write().expect("cache lock poisoned");
        let before = entries.len();
        entries.retain(|key, _| !matcher.is_match(key));
        let removed = before - entries.len();
        debug!(pattern, removed, "cache pattern invalidated");
        removed
    }

    pub fn size(&self) -> usize {
        let now = now_millis();
        self.store
            .entries
            .read()
            .expect("cache lock poisoned")
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn sweep_expired(&self) -> usize {
        self.store.sweep(now_millis())
    }

    fn remove_if_expired(&self, key: &str, now: u64) {
        let mut entries = self.store.entries.write().expect("cache lock poisoned");
        if entries.get(key).is_some_and(|entry| !entry.is_live(now)) {
            entries.remove(key);
        }
    }
}

impl<V: Clone + Send + Sync + 'static> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> TtlCache<V>
where
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    pub fn with_persistence(sweep_interval: Option<Duration>, path: &Path) -> Self {
        let mut cache = match sweep_interval {
            Some(interval) => Self::with_sweep(interval),
            None => Self::new(),
        };
        cache.snapshot = open_snapshot(path);
        if let Some(snapshot) = &cache.snapshot {
            cache.restore(snapshot);
        }
        cache
    }

    fn restore(&self, snapshot: &SnapshotStore) {
        let rows = match snapshot.load_live(now_millis()) {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %err, "cache snapshot unreadable, starting empty");
                return;
            }
        };

        let mut entries = self.store.entries.write().expect("cache lock poisoned");
        let mut skipped = 0_usize;
        for row in rows {
            match serde_json::from_str::<V>(&row.value) {
                Ok(value) => {
                    entries.insert(
                        row.key,
                        CacheEntry {
                            value,
                            expires_at: row.expires_at,
                        },
                    );
                }
                Err(_) => skipped += 1,
            }
        }
        debug!(restored = entries.len(), skipped, "cache snapshot loaded");
    }

    pub fn persist(&self) {
        let Some(snapshot) = &self.snapshot else {
            return;
        };
        let now = now_millis();
        let rows: Vec<SnapshotRow> = {
            let entries = self.store.entries.read().expect("cache lock poisoned");
            entries
                .iter()
                .filter(|(_, entry)| entry.is_live(now))
                .filter_map(|(key, entry)| match serde_json::to_string(&entry.value) {
                    Ok(value) => Some(SnapshotRow {
                        key: key.clone(),
                        value,
                        expires_at: entry.expires_at,
                    }),
                    Err(err) => {
                        warn!(key = %key, error = %err, "cache entry not serializable, skipping");
                        None
                    }
                })
                .collect()
        };

        match snapshot.replace_all(&rows) {
            Ok(()) => debug!(entries = rows.len(), "cache snapshot written"),
            Err(err) => warn!(error = %err, "failed to write cache snapshot"),
        }
    }
}

fn open_snapshot(path: &Path) -> Option<SnapshotStore> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Err(err) = fs::create_dir_all(parent) {
            warn!(path = %parent.display(), error = %err, "cannot create snapshot directory");
            return None;
        }
    }

    match SnapshotStore::open(path) {
        Ok(store) => Some(store),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "discarding corrupt cache snapshot");
            discard(path);
            SnapshotStore::open(path)
                .map_err(|err| warn!(error = %err, "cache snapshot disabled"))
                .ok()
        }
    }
}

fn discard(path: &Path) {
    let mut journal = PathBuf::from(path);
    journal.as_mut_os_string().push("-journal");
    for file in [path, journal.as_path()] {
        if file.exists() {
            if let Err(err) = fs::remove_file(file) {
                warn!(path = %file.display(), error = %err, "failed to remove snapshot file");
            }
        }
    }
}

fn spawn_sweeper<V: Send + Sync + 'static>(
    store: Weak<Store<V>>,
    interval: Duration,
) -> Option<Sweeper> {
    let (stop, stopped) = mpsc::channel::<()>();
    let handle = thread::Builder::new()
        .name("cache-sweeper".into())
        .spawn(move || loop {
            match stopped.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {}
                _ => break,
            }
            let Some(store) = store.upgrade() else {
                break;
            };
            let removed = store.sweep(now_millis());
            if removed > 0 {
                debug!(removed, "swept expired cache entries");
            }
        });

    match handle {
        Ok(handle) => Some(Sweeper {
            stop,
            handle: Some(handle),
        }),
        Err(err) => {
            warn!(error = %err, "failed to start cache sweeper, relying on lazy expiry");
            None
        }
    }
}

fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut source = String::with_capacity(pattern.len() + 8);
    source.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => source.push_str(".*"),
            '?' => source.push('.'),
            other => source.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    source.push('$');
    Regex::new(&source)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
