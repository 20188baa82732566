use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time;
use tracing::debug;

use crate::service::Shutdown;
use crate::session::data::ScratchValue;
use crate::session::handler::Direction;
use crate::session::Session;

/// Tracks every live session of a listener or dial pool.
///
/// The registry assigns session ids, supports broadcast and keyed lookup,
/// holds key/value data shared by all its sessions, and drives the recurring
/// idle sweep. Sessions reference it weakly, and the sweeper task holds only
/// a weak handle too, so dropping the registry tears everything down.
pub struct SessionRegistry {
    weak_self: Weak<SessionRegistry>,
    sessions: DashMap<u64, Arc<Session>>,
    next_id: AtomicU64,
    shared: DashMap<String, ScratchValue>,
    sweeper_stop: Mutex<Option<broadcast::Sender<()>>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<SessionRegistry> {
        Arc::new_cyclic(|weak_self| SessionRegistry {
            weak_self: weak_self.clone(),
            sessions: DashMap::new(),
            next_id: AtomicU64::new(0),
            shared: DashMap::new(),
            sweeper_stop: Mutex::new(None),
        })
    }

    pub(crate) fn add(&self, session: &Arc<Session>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        session.set_id(id);
        self.sessions.insert(id, session.clone());
        id
    }

    pub(crate) fn remove(&self, id: u64) -> bool {
        self.sessions.remove(&id).is_some()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_by_id(&self, id: u64) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    /// The session with the lowest id; what a dialer with a single
    /// connection calls "its" session.
    pub fn first_session(&self) -> Option<Arc<Session>> {
        self.sessions()
            .into_iter()
            .min_by_key(|session| session.id())
    }

    /// Snapshot of all live sessions.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Fan the payload out to every live session's write queue.
    pub async fn broadcast(&self, payload: &[u8]) {
        for session in self.sessions() {
            session.write_bytes(payload).await;
        }
    }

    /// Start (or replace) the recurring idle sweep.
    ///
    /// Every `idle_for`, each live session is checked against the threshold
    /// and `on_idle` fires for the ones that exceeded it. A zero duration
    /// stops the sweep.
    pub fn set_idle_time(&self, kind: Direction, idle_for: Duration) {
        let previous = self.sweeper_stop.lock().take();
        if let Some(stop) = previous {
            let _ = stop.send(());
        }
        if idle_for.is_zero() {
            return;
        }

        let (stop_tx, _) = broadcast::channel(1);
        *self.sweeper_stop.lock() = Some(stop_tx.clone());

        let registry = self.weak_self.clone();
        tokio::spawn(async move {
            let mut interval = time::interval(idle_for);
            // the first tick of a tokio interval fires immediately
            interval.tick().await;
            let mut shutdown = Shutdown::subscribe(&stop_tx);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!("idle sweeper exiting");
                        break;
                    }
                    _ = interval.tick() => {
                        let Some(registry) = registry.upgrade() else { break };
                        for session in registry.sessions() {
                            session.test_idle(kind, idle_for).await;
                        }
                    }
                }
            }
        });
    }

    /// Drop every tracked session without closing them.
    pub fn clear(&self) {
        self.sessions.clear();
    }

    pub fn put_shared(&self, key: impl Into<String>, value: impl Into<ScratchValue>) {
        self.shared.insert(key.into(), value.into());
    }

    pub fn get_shared(&self, key: &str) -> Option<ScratchValue> {
        self.shared.get(key).map(|entry| entry.value().clone())
    }

    pub fn has_shared(&self, key: &str) -> bool {
        self.shared.contains_key(key)
    }

    pub fn remove_shared(&self, key: &str) -> Option<ScratchValue> {
        self.shared.remove(key).map(|(_, value)| value)
    }
}
