use hyper::{HeaderMap, StatusCode};
use log::debug;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

/// What a leader publishes once its cache entry is valid on disk.
#[derive(Debug, Clone)]
pub struct Completed {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

type Slot = watch::Receiver<Option<Arc<Completed>>>;

/// Registry of cache keys with a fetch in progress.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    inner: Arc<Mutex<HashMap<PathBuf, Slot>>>,
}

pub enum Flight {
    /// Caller owns the fetch for this key.
    Leader(FlightGuard),
    /// Someone else is fetching; wait on this.
    Follower(Follower),
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, key: &Path) -> Flight {
        let mut flights = self.lock();

        if let Some(slot) = flights.get(key) {
            debug!("Joining in-flight fetch for {}", key.display());
            return Flight::Follower(Follower { slot: slot.clone() });
        }

        let (tx, rx) = watch::channel(None);
        flights.insert(key.to_path_buf(), rx);

        Flight::Leader(FlightGuard {
            key: key.to_path_buf(),
            registry: self.inner.clone(),
            tx,
        })
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, Slot>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Held by the leader for as long as it is fetching. Dropping it without
/// `complete` tells followers to fetch for themselves.
pub struct FlightGuard {
    key: PathBuf,
    registry: Arc<Mutex<HashMap<PathBuf, Slot>>>,
    tx: watch::Sender<Option<Arc<Completed>>>,
}

impl FlightGuard {
    pub fn key(&self) -> &Path {
        &self.key
    }

    pub fn complete(self, completed: Completed) {
        self.tx.send_replace(Some(Arc::new(completed)));
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let mut flights = self
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        flights.remove(&self.key);
    }
}

pub struct Follower {
    slot: Slot,
}

impl Follower {
    /// Resolves to the leader's result, or `None` if the leader gave up.
    pub async fn wait(mut self) -> Option<Arc<Completed>> {
        loop {
            let current = self.slot.borrow_and_update().clone();
            if current.is_some() {
                return current;
            }
            if self.slot.changed().await.is_err() {
                return self.slot.borrow().clone();
            }
        }
    }
}
