//! Factory/Pool (C5, §4.5): keeps a target number of [`Connection`]s open to
//! one endpoint, dispatching round-robin over whichever ones are currently
//! in `Normal` state and reconnecting lost ones with bounded exponential
//! backoff.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::config::{ClientConfig, ConnectionAddr, ConnectionInfo};
use crate::connection::Connection;
use crate::error::{ErrorKind, RedisError, RedisResult};
use crate::router::Router;

struct Slot {
    connection: Option<Connection>,
}

/// Owns the pool of connections to one endpoint. Cloning a `Factory` shares
/// the same pool; every clone sees the same membership.
#[derive(Clone)]
pub struct Factory {
    info: Arc<Mutex<Arc<ConnectionInfo>>>,
    /// Mirrors `info`'s address under a plain `std::sync::Mutex` so
    /// `Display` can read it without an async lock (§6 `Handler repr`).
    display_addr: Arc<std::sync::Mutex<ConnectionAddr>>,
    /// Mirrors the live connection count for the same reason (§6 `Handler
    /// repr`'s `"- <n> connection(s)>"` suffix).
    display_count: Arc<AtomicUsize>,
    config: Arc<ClientConfig>,
    slots: Arc<Mutex<Vec<Slot>>>,
    cursor: Arc<AtomicUsize>,
    ready: watch::Sender<bool>,
    continue_trying: Arc<std::sync::atomic::AtomicBool>,
}

impl Factory {
    /// Builds a pool of `config.pool_size` connections to `info`. In eager
    /// mode (the default, §4.5) this does not return until the pool is
    /// full; in lazy mode it returns immediately and the caller awaits
    /// [`Factory::ready`].
    pub async fn new(info: ConnectionInfo, config: ClientConfig) -> RedisResult<Self> {
        let (ready, _) = watch::channel(false);
        let display_addr = Arc::new(std::sync::Mutex::new(info.addr.clone()));
        let continue_trying = config.reconnect;
        let factory = Factory {
            info: Arc::new(Mutex::new(Arc::new(info))),
            display_addr,
            display_count: Arc::new(AtomicUsize::new(0)),
            config: Arc::new(config),
            slots: Arc::new(Mutex::new(Vec::new())),
            cursor: Arc::new(AtomicUsize::new(0)),
            ready,
            continue_trying: Arc::new(std::sync::atomic::AtomicBool::new(continue_trying)),
        };
        let eager = factory.config.eager_connect;
        factory.fill().await?;
        if eager {
            factory.mark_ready();
        } else {
            let bg = factory.clone();
            tokio::spawn(async move {
                if bg.fill().await.is_ok() {
                    bg.mark_ready();
                }
            });
        }
        Ok(factory)
    }

    fn mark_ready(&self) {
        let _ = self.ready.send(true);
    }

    /// Resolves once the pool has reached its target size.
    pub async fn ready(&self) {
        let mut rx = self.ready.subscribe();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }

    async fn fill(&self) -> RedisResult<()> {
        let target = self.config.pool_size;
        loop {
            let current = self.slots.lock().await.len();
            if current >= target {
                return Ok(());
            }
            let info = self.info.lock().await.clone();
            let conn = Connection::connect(&info, &self.config).await?;
            self.push_slot(conn).await;
        }
    }

    /// Adds a freshly connected `Connection` to the pool and arranges for
    /// its transport loss to be noticed (§4.5).
    async fn push_slot(&self, conn: Connection) {
        self.watch_for_loss(conn.clone());
        let mut slots = self.slots.lock().await;
        slots.push(Slot { connection: Some(conn) });
        self.display_count.store(slots.iter().filter(|s| s.connection.is_some()).count(), Ordering::Relaxed);
    }

    /// Spawns a task that waits for `conn`'s router to report its driver
    /// task has exited, then — unless the closure was this crate's own
    /// `Connection::disconnect` — removes the dead slot and schedules a
    /// reconnect. This is what actually wires §4.5's "on transport loss, the
    /// lost Connection is removed from the pool and a reconnect attempt is
    /// scheduled" to something that runs.
    fn watch_for_loss(&self, conn: Connection) {
        let factory = self.clone();
        tokio::spawn(async move {
            conn.router().wait_closed().await;
            if conn.is_intentionally_closed() {
                return;
            }
            factory.remove_dead_slot(conn.router()).await;
            factory.handle_lost_connection(Duration::from_secs(10));
        });
    }

    async fn remove_dead_slot(&self, router: &Router) {
        let mut slots = self.slots.lock().await;
        slots.retain(|slot| match &slot.connection {
            Some(conn) => !conn.router().same_channel(router),
            None => true,
        });
        self.display_count.store(slots.iter().filter(|s| s.connection.is_some()).count(), Ordering::Relaxed);
    }

    pub fn target_addr(&self) -> ConnectionAddr {
        self.display_addr.lock().unwrap().clone()
    }

    /// Live connection count, readable synchronously for `Display` (§6).
    pub fn display_count(&self) -> usize {
        self.display_count.load(Ordering::Relaxed)
    }

    /// Round-robin dispatch, skipping reserved connections (§4.5). Raises
    /// *in-transaction* if every pool member is currently reserved.
    pub async fn get_connection(&self) -> RedisResult<Connection> {
        let slots = self.slots.lock().await;
        if slots.is_empty() {
            return Err(RedisError::new(ErrorKind::ConnectionError, "pool has no connections"));
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % slots.len();
        for offset in 0..slots.len() {
            let idx = (start + offset) % slots.len();
            if let Some(conn) = &slots[idx].connection {
                if !conn.is_reserved() {
                    return Ok(conn.clone());
                }
            }
        }
        Err(RedisError::new(ErrorKind::InTransaction, "every pool connection is reserved"))
    }

    /// Like [`Factory::get_connection`] but does not skip reserved
    /// connections; used to hand out a connection the caller is about to
    /// reserve for a transaction, pipeline, or subscriber session.
    pub async fn get_connection_exclusive(&self) -> RedisResult<Connection> {
        let slots = self.slots.lock().await;
        slots
            .iter()
            .find_map(|s| s.connection.clone())
            .ok_or_else(|| RedisError::new(ErrorKind::ConnectionError, "pool has no connections"))
    }

    pub async fn size(&self) -> usize {
        self.slots.lock().await.iter().filter(|s| s.connection.is_some()).count()
    }

    /// Removes a dead connection and schedules a bounded-backoff reconnect
    /// attempt (§4.5). `max_delay` defaults to 10s for ordinary factories
    /// and 120s for subscriber factories at the call site.
    pub fn handle_lost_connection(&self, max_delay: Duration) {
        let factory = self.clone();
        tokio::spawn(async move {
            let mut delay = factory.config.reconnect_initial_backoff;
            loop {
                if !factory.continue_trying.load(Ordering::Relaxed) {
                    return;
                }
                tokio::time::sleep(jittered(delay)).await;
                let info = factory.info.lock().await.clone();
                match Connection::connect(&info, &factory.config).await {
                    Ok(conn) => {
                        info!("reconnected after transport loss");
                        factory.push_slot(conn).await;
                        return;
                    }
                    Err(err) => {
                        warn!(error = %err, delay = ?delay, "reconnect attempt failed");
                        delay = std::cmp::min(delay * 2, max_delay);
                    }
                }
            }
        });
    }

    /// Tears down every connection and re-establishes to a new endpoint
    /// (Sentinel-driven master failover, §4.5, §4.8). In-flight requests on
    /// the old connections fail with *connection-error* as soon as their
    /// router task notices the socket close.
    pub async fn replace_endpoint(&self, info: ConnectionInfo) -> RedisResult<()> {
        let old: Vec<Connection> = {
            let mut slots = self.slots.lock().await;
            slots.drain(..).filter_map(|s| s.connection).collect()
        };
        self.display_count.store(0, Ordering::Relaxed);
        for conn in old {
            conn.disconnect().await;
        }
        *self.display_addr.lock().unwrap() = info.addr.clone();
        *self.info.lock().await = Arc::new(info);
        self.fill().await
    }

    /// Stops reconnection and tears down every connection (§4.6
    /// `disconnect`); resolves once the pool is empty.
    pub async fn disconnect(&self) {
        self.continue_trying.store(false, Ordering::Relaxed);
        let mut slots = self.slots.lock().await;
        self.display_count.store(0, Ordering::Relaxed);
        for slot in slots.drain(..) {
            if let Some(conn) = slot.connection {
                conn.disconnect().await;
            }
        }
    }
}

pub(crate) fn jittered(base: Duration) -> Duration {
    let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 4 + 1);
    base + Duration::from_millis(jitter_ms)
}
