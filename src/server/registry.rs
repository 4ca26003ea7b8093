//! Session registry
//!
//! The set of live sessions, owned by one task and reached only through a
//! [`RegistryHandle`]. Sessions register on start and deregister on teardown;
//! a periodic sweep cancels sessions whose client or backend leg has been
//! silent longer than `session.idle_timeout_secs`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::session::{DisconnectReason, Leg};

/// Per-leg last-activity clock shared between a session driver and the
/// registry.
///
/// Stored as milliseconds since the session started so updates are a single
/// atomic store.
#[derive(Debug)]
pub struct LegActivity {
    started: Instant,
    client_ms: AtomicU64,
    backend_ms: AtomicU64,
}

impl LegActivity {
    pub fn new() -> Self {
        Self::started_at(Instant::now())
    }

    fn started_at(started: Instant) -> Self {
        Self {
            started,
            client_ms: AtomicU64::new(0),
            backend_ms: AtomicU64::new(0),
        }
    }

    /// Record a read from or write to `leg`.
    pub fn touch(&self, leg: Leg) {
        let now = self.started.elapsed().as_millis() as u64;
        self.slot(leg).store(now, Ordering::Relaxed);
    }

    /// Time since `leg` last saw traffic.
    pub fn idle_for(&self, leg: Leg) -> Duration {
        let last = Duration::from_millis(self.slot(leg).load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }

    fn slot(&self, leg: Leg) -> &AtomicU64 {
        match leg {
            Leg::Client => &self.client_ms,
            Leg::Backend => &self.backend_ms,
        }
    }
}

impl Default for LegActivity {
    fn default() -> Self {
        Self::new()
    }
}

enum Command {
    Register {
        id: Uuid,
        peer: String,
        activity: Arc<LegActivity>,
        cancel: oneshot::Sender<DisconnectReason>,
    },
    Deregister {
        id: Uuid,
    },
    Count {
        reply: oneshot::Sender<usize>,
    },
    ShutdownAll {
        reply: oneshot::Sender<usize>,
    },
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Register { id, .. } => write!(f, "Register({})", id),
            Command::Deregister { id } => write!(f, "Deregister({})", id),
            Command::Count { .. } => write!(f, "Count"),
            Command::ShutdownAll { .. } => write!(f, "ShutdownAll"),
        }
    }
}

struct Entry {
    peer: String,
    activity: Arc<LegActivity>,
    cancel: oneshot::Sender<DisconnectReason>,
}

struct Registry {
    sessions: HashMap<Uuid, Entry>,
    idle_timeout: Duration,
    /// Set by `ShutdownAll`; later registrations are cancelled on arrival
    closed: bool,
}

impl Registry {
    fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            idle_timeout,
            closed: false,
        }
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Register {
                id,
                peer,
                activity,
                cancel,
            } => {
                if self.closed {
                    debug!("Session {} from {} arrived during shutdown", id, peer);
                    let _ = cancel.send(DisconnectReason::Shutdown);
                    return;
                }
                trace!("Registered session {} from {}", id, peer);
                self.sessions.insert(
                    id,
                    Entry {
                        peer,
                        activity,
                        cancel,
                    },
                );
            }
            Command::Deregister { id } => {
                if self.sessions.remove(&id).is_some() {
                    trace!("Deregistered session {}", id);
                }
            }
            Command::Count { reply } => {
                let _ = reply.send(self.sessions.len());
            }
            Command::ShutdownAll { reply } => {
                self.closed = true;
                let count = self.sessions.len();
                for (_, entry) in self.sessions.drain() {
                    let _ = entry.cancel.send(DisconnectReason::Shutdown);
                }
                let _ = reply.send(count);
            }
        }
    }

    /// Cancel every session with a leg idle past the timeout. Returns how
    /// many were cancelled.
    fn sweep(&mut self) -> usize {
        let idle_timeout = self.idle_timeout;
        let expired: Vec<(Uuid, Leg, Duration)> = self
            .sessions
            .iter()
            .filter_map(|(id, entry)| {
                [Leg::Client, Leg::Backend]
                    .into_iter()
                    .map(|leg| (leg, entry.activity.idle_for(leg)))
                    .filter(|(_, idle)| *idle > idle_timeout)
                    .max_by_key(|(_, idle)| *idle)
                    .map(|(leg, idle)| (*id, leg, idle))
            })
            .collect();

        for (id, leg, idle) in &expired {
            if let Some(entry) = self.sessions.remove(id) {
                debug!(
                    session_id = %id,
                    peer = %entry.peer,
                    "Session idle on {} leg for {:?}, cancelling",
                    leg,
                    idle
                );
                let _ = entry.cancel.send(DisconnectReason::IdleTimeout {
                    leg: *leg,
                    idle: *idle,
                });
            }
        }
        expired.len()
    }
}

/// Cloneable handle to the registry task.
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl RegistryHandle {
    /// Insert a session. The returned receiver fires when the registry wants
    /// the session torn down (idle timeout or shutdown).
    pub fn register(
        &self,
        id: Uuid,
        peer: String,
        activity: Arc<LegActivity>,
    ) -> oneshot::Receiver<DisconnectReason> {
        let (cancel, rx) = oneshot::channel();
        let _ = self.tx.send(Command::Register {
            id,
            peer,
            activity,
            cancel,
        });
        rx
    }

    pub fn deregister(&self, id: Uuid) {
        let _ = self.tx.send(Command::Deregister { id });
    }

    /// Number of registered sessions.
    pub async fn count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Count { reply }).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Cancel every live session with [`DisconnectReason::Shutdown`].
    pub async fn shutdown_all(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::ShutdownAll { reply }).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Start the registry task. It runs until every handle is dropped.
pub fn spawn_registry(config: &SessionConfig) -> (RegistryHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let idle_timeout = Duration::from_secs(config.idle_timeout_secs);
    let sweep_every = Duration::from_secs(config.sweep_interval_secs.max(1));

    let handle = tokio::spawn(async move {
        let mut registry = Registry::new(idle_timeout);
        let mut interval = tokio::time::interval(sweep_every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => registry.handle(cmd),
                    None => break,
                },
                _ = interval.tick(), if !idle_timeout.is_zero() => {
                    let cancelled = registry.sweep();
                    if cancelled > 0 {
                        debug!(cancelled = cancelled, "Idle sweep completed");
                    }
                }
            }
        }
        debug!("Session registry stopped");
    });

    (RegistryHandle { tx }, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stale_activity(secs: u64) -> Arc<LegActivity> {
        let started = Instant::now()
            .checked_sub(Duration::from_secs(secs))
            .unwrap();
        Arc::new(LegActivity::started_at(started))
    }

    fn register(
        registry: &mut Registry,
        activity: Arc<LegActivity>,
    ) -> oneshot::Receiver<DisconnectReason> {
        let (cancel, rx) = oneshot::channel();
        registry.handle(Command::Register {
            id: Uuid::new_v4(),
            peer: "127.0.0.1:5000".into(),
            activity,
            cancel,
        });
        rx
    }

    #[test]
    fn test_touch_resets_idle() {
        let activity = stale_activity(10);
        assert!(activity.idle_for(Leg::Client) >= Duration::from_secs(10));
        activity.touch(Leg::Client);
        assert!(activity.idle_for(Leg::Client) < Duration::from_secs(1));
        assert!(activity.idle_for(Leg::Backend) >= Duration::from_secs(10));
    }

    #[test]
    fn test_sweep_cancels_idle_sessions_only() {
        let mut registry = Registry::new(Duration::from_secs(5));

        let mut idle_rx = register(&mut registry, stale_activity(10));

        let fresh = stale_activity(10);
        fresh.touch(Leg::Client);
        fresh.touch(Leg::Backend);
        let mut fresh_rx = register(&mut registry, fresh);

        assert_eq!(registry.sweep(), 1);
        assert_eq!(registry.sessions.len(), 1);

        match idle_rx.try_recv().unwrap() {
            DisconnectReason::IdleTimeout { idle, .. } => {
                assert!(idle >= Duration::from_secs(10))
            }
            other => panic!("unexpected reason {:?}", other),
        }
        assert!(fresh_rx.try_recv().is_err());
    }

    #[test]
    fn test_sweep_reports_the_idle_leg() {
        let mut registry = Registry::new(Duration::from_secs(5));
        let activity = stale_activity(10);
        activity.touch(Leg::Client);
        let mut rx = register(&mut registry, activity);

        registry.sweep();
        assert!(matches!(
            rx.try_recv().unwrap(),
            DisconnectReason::IdleTimeout {
                leg: Leg::Backend,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_register_count_deregister() {
        let config = SessionConfig {
            idle_timeout_secs: 0,
            sweep_interval_secs: 1,
        };
        let (handle, task) = spawn_registry(&config);

        let id = Uuid::new_v4();
        let _rx = handle.register(id, "peer".into(), Arc::new(LegActivity::new()));
        assert_eq!(handle.count().await, 1);

        handle.deregister(id);
        assert_eq!(handle.count().await, 0);

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_all_cancels_sessions() {
        let (handle, _task) = spawn_registry(&SessionConfig::default());

        let rx1 = handle.register(Uuid::new_v4(), "a".into(), Arc::new(LegActivity::new()));
        let rx2 = handle.register(Uuid::new_v4(), "b".into(), Arc::new(LegActivity::new()));

        assert_eq!(handle.shutdown_all().await, 2);
        assert_eq!(rx1.await.unwrap(), DisconnectReason::Shutdown);
        assert_eq!(rx2.await.unwrap(), DisconnectReason::Shutdown);
        assert_eq!(handle.count().await, 0);
    }

    #[tokio::test]
    async fn test_registration_after_shutdown_is_cancelled() {
        let (handle, task) = spawn_registry(&SessionConfig::default());
        assert_eq!(handle.shutdown_all().await, 0);

        let late = handle.register(Uuid::new_v4(), "late".into(), Arc::new(LegActivity::new()));
        assert_eq!(late.await.unwrap(), DisconnectReason::Shutdown);
        assert_eq!(handle.count().await, 0);

        drop(handle);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
