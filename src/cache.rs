use std::{
    collections::HashMap,
    fs::{self, File},
    io::{self, BufReader},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tracing::{debug, error, warn};

use crate::engine::{IdentityState, StateNotifier, Watermark};

/// Last seen post of every identity ever followed.
#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
pub struct StateCache {
    #[serde(default)]
    pub identities: HashMap<String, CachedIdentity>,
}

#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
pub struct CachedIdentity {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub latest_dynamic: String,
    #[serde(default)]
    pub latest_time: u64,
}

/// Keeps [`StateCache`] on disk in sync with the engine.
///
/// Notifications arrive on runtime worker threads, so the file itself is
/// written from tokio's blocking pool.
pub struct CacheStore {
    records: Mutex<StateCache>,
    revision: AtomicU64,
    file: Arc<CacheFile>,
}

struct CacheFile {
    path: PathBuf,
    /// Revision of the snapshot currently on disk.
    written: Mutex<u64>,
}

impl StateCache {
    pub fn new() -> Self {
        Default::default()
    }

    /// Missing file means a fresh start, a broken one is reported and
    /// ignored.
    pub fn load(path: &Path) -> io::Result<Self> {
        let file = match File::open(path) {
            Ok(f) => BufReader::new(f),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(e),
        };

        match serde_json::from_reader(file) {
            Ok(v) => Ok(v),
            Err(e) => {
                warn!("failed to parse cache file, starting from scratch: {e}");
                Ok(Self::new())
            }
        }
    }

    pub fn states(&self) -> impl Iterator<Item = IdentityState> + '_ {
        self.identities.iter().map(|(uid, cached)| IdentityState {
            uid: uid.clone(),
            display_name: cached.username.clone(),
            watermark: Watermark::new(cached.latest_dynamic.clone(), cached.latest_time),
        })
    }

    pub fn record(&mut self, state: &IdentityState) {
        self.identities.insert(
            state.uid.clone(),
            CachedIdentity {
                username: state.display_name.clone(),
                latest_dynamic: state.watermark.post_id.clone(),
                latest_time: state.watermark.timestamp,
            },
        );
    }
}

impl CacheStore {
    pub fn new(path: PathBuf, records: StateCache) -> Self {
        Self {
            records: Mutex::new(records),
            revision: AtomicU64::new(0),
            file: Arc::new(CacheFile {
                path,
                written: Mutex::new(0),
            }),
        }
    }
}

impl CacheFile {
    /// Write `data` unless a newer snapshot already made it to disk.
    fn write(&self, revision: u64, data: &str) {
        let mut written = self.written.lock().unwrap_or_else(PoisonError::into_inner);
        if *written >= revision {
            debug!(revision, "skipping stale cache snapshot");
            return;
        }

        match fs::write(&self.path, data) {
            Ok(()) => *written = revision,
            Err(e) => error!(path = %self.path.display(), "failed to write cache: {e}"),
        }
    }
}

impl StateNotifier for CacheStore {
    fn notify(&self, state: &IdentityState) {
        let (revision, data) = {
            let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
            records.record(state);

            match serde_json::to_string(&*records) {
                Ok(data) => (self.revision.fetch_add(1, Ordering::SeqCst) + 1, data),
                Err(e) => {
                    error!("failed to serialize cache: {e}");
                    return;
                }
            }
        };
        debug!(uid = %state.uid, post_id = %state.watermark.post_id, revision, "state recorded");

        match Handle::try_current() {
            Ok(runtime) => {
                let file = Arc::clone(&self.file);
                runtime.spawn_blocking(move || file.write(revision, &data));
            }
            Err(_) => self.file.write(revision, &data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("bdynfeed-{}-{name}.json", std::process::id()))
    }

    #[test]
    fn missing_file_is_empty_cache() {
        let cache = StateCache::load(&temp_path("missing")).unwrap();

        assert_eq!(cache, StateCache::new());
    }

    #[test]
    fn broken_file_is_empty_cache() {
        let path = temp_path("broken");
        fs::write(&path, "{ nope").unwrap();

        let cache = StateCache::load(&path).unwrap();

        assert_eq!(cache, StateCache::new());
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn notifications_are_written_through() {
        let path = temp_path("store");
        let store = CacheStore::new(path.clone(), StateCache::new());

        store.notify(&IdentityState {
            uid: "42".to_owned(),
            display_name: "alice".to_owned(),
            watermark: Watermark::new("100", 1000),
        });
        store.notify(&IdentityState {
            uid: "42".to_owned(),
            display_name: "alice".to_owned(),
            watermark: Watermark::new("99", 1000),
        });

        let cache = StateCache::load(&path).unwrap();
        assert_eq!(
            cache.identities["42"],
            CachedIdentity {
                username: "alice".to_owned(),
                latest_dynamic: "99".to_owned(),
                latest_time: 1000,
            }
        );
        let states: Vec<IdentityState> = cache.states().collect();
        assert_eq!(states[0].watermark, Watermark::new("99", 1000));
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn stale_snapshot_does_not_overwrite_newer() {
        let path = temp_path("stale");
        let file = CacheFile {
            path: path.clone(),
            written: Mutex::new(0),
        };

        file.write(2, "newer");
        file.write(1, "older");

        assert_eq!(fs::read_to_string(&path).unwrap(), "newer");
        fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn runtime_writes_land_on_disk() {
        let path = temp_path("runtime");
        let store = CacheStore::new(path.clone(), StateCache::new());

        for (id, ts) in [("1", 10), ("2", 20), ("3", 30)] {
            store.notify(&IdentityState {
                uid: "42".to_owned(),
                display_name: "alice".to_owned(),
                watermark: Watermark::new(id, ts),
            });
        }

        let mut latest = None;
        for _ in 0..200 {
            latest = StateCache::load(&path)
                .unwrap()
                .identities
                .get("42")
                .map(|c| c.latest_dynamic.clone());
            if latest.as_deref() == Some("3") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        assert_eq!(latest.as_deref(), Some("3"));
        fs::remove_file(path).unwrap();
    }
}
