//! Presence tracking
//!
//! A single actor task owns all presence state: per-identity connection
//! counts, the online set, settle timers, the guest eviction timers and the
//! presence writes still owed to the store. Other tasks talk to it through a
//! [`PresenceHandle`].
//!
//! Transitions:
//! - first connection of an identity cancels any pending settle timer and
//!   guest eviction; if the identity was offline it goes online and a
//!   debounced broadcast is scheduled
//! - last connection closing starts the settle timer; on expiry an identity
//!   still without connections goes offline, and guests start their grace
//!   period
//! - the periodic sweep deletes guests whose grace period has run out and
//!   flushes pending presence writes
//!
//! The actor never waits on the store. A sweep hands its writes and
//! evictions to a spawned task and applies the results when that task
//! reports back, so connections keep flowing through a store outage.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use parley_shared::{Identity, IdentityId, PresenceRecord, ServerEvent, Store, StoreResult};

use super::connection::Connection;
use super::gateway::Gateway;

/// Sent to a connection whose guest identity is being or has been evicted
pub const EVICTED_REASON: &str = "Identity no longer exists";

/// Presence timing parameters
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Delay between an identity's last connection closing and it going offline
    pub settle_delay: Duration,
    /// Window over which presence changes coalesce into one broadcast
    pub debounce_window: Duration,
    /// How long an offline guest is kept before it is deleted
    pub guest_grace: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(3),
            debounce_window: Duration::from_millis(500),
            guest_grace: Duration::from_secs(300),
        }
    }
}

/// Point-in-time view of the tracker's state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceSnapshot {
    /// Online identities ordered by id
    pub online: Vec<Identity>,
    /// Identities without connections whose settle timer is running
    pub settling: Vec<IdentityId>,
    /// Offline guests waiting out their grace period
    pub pending_evictions: Vec<IdentityId>,
    /// Presence writes not yet accepted by the store
    pub pending_writes: usize,
}

/// Outcome of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: usize,
    pub eviction_failures: usize,
    pub presence_written: usize,
    pub presence_failures: usize,
}

#[derive(Debug, thiserror::Error)]
#[error("presence tracker has stopped")]
pub struct TrackerStopped;

enum Command {
    Connected(Arc<Connection>),
    Disconnected(IdentityId),
    SettleExpired { identity_id: IdentityId, generation: u64 },
    FlushBroadcast,
    Sweep(oneshot::Sender<SweepReport>),
    SweepFinished(SweepOutcome),
    Snapshot(oneshot::Sender<PresenceSnapshot>),
}

/// Store work of one sweep, decided by the actor
struct SweepPlan {
    list_online: bool,
    evict: Vec<IdentityId>,
    writes: Vec<PresenceRecord>,
}

/// Results of a [`SweepPlan`], handed back to the actor
struct SweepOutcome {
    stale_online: Option<StoreResult<Vec<Identity>>>,
    evictions: Vec<(IdentityId, StoreResult<bool>)>,
    writes: Vec<(PresenceRecord, StoreResult<()>)>,
}

/// Cloneable handle to the presence actor
#[derive(Clone)]
pub struct PresenceHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl PresenceHandle {
    /// A connection has been registered. The tracker queues the current
    /// online set on it, or closes it if its guest identity is being evicted.
    pub fn connected(&self, conn: Arc<Connection>) {
        self.send(Command::Connected(conn));
    }

    /// A connection for `identity_id` has been closed
    pub fn disconnected(&self, identity_id: IdentityId) {
        self.send(Command::Disconnected(identity_id));
    }

    fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            tracing::warn!("Presence tracker stopped, dropping presence update");
        }
    }

    /// Run a sweep and wait for its outcome. A request made while another
    /// sweep is running gets a fresh sweep once that one finishes.
    pub async fn sweep(&self) -> Result<SweepReport, TrackerStopped> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::Sweep(reply)).map_err(|_| TrackerStopped)?;
        rx.await.map_err(|_| TrackerStopped)
    }

    pub async fn snapshot(&self) -> Result<PresenceSnapshot, TrackerStopped> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Snapshot(reply))
            .map_err(|_| TrackerStopped)?;
        rx.await.map_err(|_| TrackerStopped)
    }
}

/// Start the presence actor. It stops once every handle is dropped.
pub fn spawn(
    config: PresenceConfig,
    gateway: Arc<Gateway>,
    store: Arc<dyn Store>,
) -> (PresenceHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let tracker = Tracker {
        config,
        gateway,
        store,
        self_tx: tx.downgrade(),
        connections: HashMap::new(),
        online: BTreeMap::new(),
        settling: HashMap::new(),
        next_generation: 0,
        evictions: HashMap::new(),
        evicting: HashSet::new(),
        evicted: HashMap::new(),
        broadcast_scheduled: false,
        pending_writes: HashMap::new(),
        reconciled: false,
        sweep_running: false,
        running_waiters: Vec::new(),
        queued_waiters: Vec::new(),
    };
    let task = tokio::spawn(tracker.run(rx));
    (PresenceHandle { tx }, task)
}

struct Tracker {
    config: PresenceConfig,
    gateway: Arc<Gateway>,
    store: Arc<dyn Store>,
    self_tx: mpsc::WeakUnboundedSender<Command>,

    /// Open connections per identity; absent means zero
    connections: HashMap<IdentityId, usize>,
    online: BTreeMap<IdentityId, Identity>,
    /// Running settle timer per identity, tagged with a generation so a
    /// timer that fired after being replaced is ignored
    settling: HashMap<IdentityId, (u64, JoinHandle<()>)>,
    next_generation: u64,
    /// Offline guests and when they went offline
    evictions: HashMap<IdentityId, Instant>,
    /// Guests whose deletion is in flight
    evicting: HashSet<IdentityId>,
    /// Recently deleted guests. A credential resolved just before the
    /// deletion can still reach `Connected`.
    evicted: HashMap<IdentityId, Instant>,
    broadcast_scheduled: bool,
    /// Latest presence state per identity not yet written to the store
    pending_writes: HashMap<IdentityId, PresenceRecord>,
    /// Whether the store's stale online set has been cleared since startup
    reconciled: bool,

    sweep_running: bool,
    /// Callers answered by the running sweep
    running_waiters: Vec<oneshot::Sender<SweepReport>>,
    /// Callers that asked while a sweep was running
    queued_waiters: Vec<oneshot::Sender<SweepReport>>,
}

impl Tracker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        tracing::info!(
            settle_ms = self.config.settle_delay.as_millis() as u64,
            debounce_ms = self.config.debounce_window.as_millis() as u64,
            guest_grace_secs = self.config.guest_grace.as_secs(),
            "Presence tracker started"
        );

        // Loads the store's stale online set
        self.start_sweep(Vec::new());

        while let Some(command) = rx.recv().await {
            match command {
                Command::Connected(conn) => self.on_connected(&conn),
                Command::Disconnected(identity_id) => self.on_disconnected(identity_id),
                Command::SettleExpired {
                    identity_id,
                    generation,
                } => self.on_settle_expired(identity_id, generation),
                Command::FlushBroadcast => self.flush_broadcast().await,
                Command::Sweep(reply) => {
                    if self.sweep_running {
                        self.queued_waiters.push(reply);
                    } else {
                        self.start_sweep(vec![reply]);
                    }
                }
                Command::SweepFinished(outcome) => self.on_sweep_finished(outcome),
                Command::Snapshot(reply) => {
                    let _ = reply.send(self.snapshot());
                }
            }
        }

        for (_, (_, timer)) in self.settling.drain() {
            timer.abort();
        }
        tracing::info!("Presence tracker stopped");
    }

    fn record(identity_id: IdentityId, is_online: bool) -> PresenceRecord {
        PresenceRecord {
            identity_id,
            is_online,
            last_seen: OffsetDateTime::now_utc(),
        }
    }

    fn on_connected(&mut self, conn: &Connection) {
        let identity = &conn.identity;
        let id = identity.id;

        if self.evicting.contains(&id) || self.evicted.contains_key(&id) {
            tracing::warn!(identity_id = id, session_id = %conn.session_id, "Connection for evicted guest refused");
            let _ = conn.send(ServerEvent::Error {
                message: EVICTED_REASON.to_string(),
                idempotency_token: None,
            });
            conn.close();
            return;
        }

        let count = self.connections.entry(id).or_insert(0);
        *count += 1;
        if *count == 1 {
            if let Some((_, timer)) = self.settling.remove(&id) {
                timer.abort();
                tracing::debug!(identity_id = id, "Reconnected while settling, staying online");
            }
            if self.evictions.remove(&id).is_some() {
                tracing::info!(identity_id = id, "Guest reconnected within grace period, eviction cancelled");
            }

            if !self.online.contains_key(&id) {
                tracing::info!(identity_id = id, kind = identity.kind.as_str(), "Identity online");
                self.online.insert(id, identity.clone());
                self.pending_writes.insert(id, Self::record(id, true));
                self.schedule_broadcast();
            }
        }

        let _ = conn.send(ServerEvent::PresenceChanged {
            online: self.online.values().cloned().collect(),
        });
    }

    fn on_disconnected(&mut self, identity_id: IdentityId) {
        let Some(count) = self.connections.get_mut(&identity_id) else {
            tracing::debug!(identity_id, "Disconnect for identity without connections");
            return;
        };
        *count -= 1;
        if *count > 0 {
            return;
        }
        self.connections.remove(&identity_id);

        self.next_generation += 1;
        let generation = self.next_generation;
        let delay = self.config.settle_delay;
        let tx = self.self_tx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Command::SettleExpired {
                    identity_id,
                    generation,
                });
            }
        });

        if let Some((_, previous)) = self.settling.insert(identity_id, (generation, timer)) {
            previous.abort();
        }
        tracing::debug!(identity_id, "Last connection closed, settling");
    }

    fn on_settle_expired(&mut self, identity_id: IdentityId, generation: u64) {
        match self.settling.get(&identity_id) {
            Some((current, _)) if *current == generation => {
                self.settling.remove(&identity_id);
            }
            _ => return,
        }
        if self.connections.contains_key(&identity_id) {
            return;
        }

        let Some(identity) = self.online.remove(&identity_id) else {
            return;
        };
        tracing::info!(identity_id, kind = identity.kind.as_str(), "Identity offline");
        self.pending_writes
            .insert(identity_id, Self::record(identity_id, false));

        if identity.is_guest() {
            self.evictions.insert(identity_id, Instant::now());
            tracing::info!(
                identity_id,
                grace_secs = self.config.guest_grace.as_secs(),
                "Guest eviction scheduled"
            );
        }
        self.schedule_broadcast();
    }

    /// Open a broadcast window unless one is already open. Every change made
    /// before the window closes is carried by the one trailing broadcast.
    fn schedule_broadcast(&mut self) {
        if self.broadcast_scheduled {
            return;
        }
        self.broadcast_scheduled = true;

        let window = self.config.debounce_window;
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Command::FlushBroadcast);
            }
        });
    }

    async fn flush_broadcast(&mut self) {
        self.broadcast_scheduled = false;
        let online: Vec<Identity> = self.online.values().cloned().collect();
        let online_count = online.len();
        let recipients = self
            .gateway
            .broadcast_all(ServerEvent::PresenceChanged { online })
            .await;
        tracing::debug!(online_count, recipients, "Broadcast presence change");
    }

    /// Decide what the sweep must do and run it on its own task
    fn start_sweep(&mut self, waiters: Vec<oneshot::Sender<SweepReport>>) {
        let grace = self.config.guest_grace;
        self.evicted.retain(|_, at| at.elapsed() < grace);

        let evict: Vec<IdentityId> = self
            .evictions
            .iter()
            .filter(|(id, since)| since.elapsed() >= grace && !self.connections.contains_key(*id))
            .map(|(id, _)| *id)
            .collect();
        self.evicting.extend(evict.iter().copied());

        let plan = SweepPlan {
            list_online: !self.reconciled,
            writes: self
                .pending_writes
                .values()
                .filter(|record| !self.evicting.contains(&record.identity_id))
                .cloned()
                .collect(),
            evict,
        };

        self.sweep_running = true;
        self.running_waiters = waiters;

        let store = Arc::clone(&self.store);
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let outcome = run_sweep(store.as_ref(), plan).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Command::SweepFinished(outcome));
            }
        });
    }

    fn on_sweep_finished(&mut self, outcome: SweepOutcome) {
        let mut report = SweepReport::default();

        if let Some(stale) = outcome.stale_online {
            self.apply_cold_start(stale);
        }

        for (identity_id, result) in outcome.evictions {
            self.evicting.remove(&identity_id);
            match result {
                Ok(existed) => {
                    self.evictions.remove(&identity_id);
                    self.pending_writes.remove(&identity_id);
                    self.evicted.insert(identity_id, Instant::now());
                    report.evicted += 1;
                    tracing::info!(identity_id, existed, "Evicted guest identity");
                }
                Err(e) => {
                    report.eviction_failures += 1;
                    tracing::error!(
                        identity_id,
                        error = %e,
                        "Failed to evict guest identity, will retry on next sweep"
                    );
                }
            }
        }
        if report.evicted > 0 {
            self.schedule_broadcast();
        }

        for (record, result) in outcome.writes {
            match result {
                Ok(()) => {
                    // A newer transition may have been recorded meanwhile
                    if self.pending_writes.get(&record.identity_id) == Some(&record) {
                        self.pending_writes.remove(&record.identity_id);
                    }
                    report.presence_written += 1;
                }
                Err(e) => {
                    report.presence_failures += 1;
                    tracing::warn!(
                        identity_id = record.identity_id,
                        is_online = record.is_online,
                        error = %e,
                        "Failed to record presence, will retry on next sweep"
                    );
                }
            }
        }

        if report != SweepReport::default() {
            tracing::debug!(
                evicted = report.evicted,
                eviction_failures = report.eviction_failures,
                presence_written = report.presence_written,
                presence_failures = report.presence_failures,
                "Presence sweep finished"
            );
        }

        self.sweep_running = false;
        for waiter in self.running_waiters.drain(..) {
            let _ = waiter.send(report);
        }
        if !self.queued_waiters.is_empty() {
            let waiters = std::mem::take(&mut self.queued_waiters);
            self.start_sweep(waiters);
        }
    }

    /// Nothing survives a restart: whoever the store still lists as online
    /// is written offline, and orphaned guests start their grace period now.
    fn apply_cold_start(&mut self, stale: StoreResult<Vec<Identity>>) {
        let stale = match stale {
            Ok(stale) => stale,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load stale online set, will retry on next sweep");
                return;
            }
        };

        let mut orphaned_guests = 0;
        for identity in &stale {
            if self.connections.contains_key(&identity.id) || self.online.contains_key(&identity.id) {
                continue;
            }
            self.pending_writes
                .insert(identity.id, Self::record(identity.id, false));
            if identity.is_guest() {
                self.evictions.entry(identity.id).or_insert_with(Instant::now);
                orphaned_guests += 1;
            }
        }
        self.reconciled = true;

        tracing::info!(
            stale_online = stale.len(),
            orphaned_guests,
            "Reconciled presence after startup"
        );
    }

    fn snapshot(&self) -> PresenceSnapshot {
        let mut settling: Vec<IdentityId> = self.settling.keys().copied().collect();
        settling.sort_unstable();
        let mut pending_evictions: Vec<IdentityId> = self.evictions.keys().copied().collect();
        pending_evictions.sort_unstable();

        PresenceSnapshot {
            online: self.online.values().cloned().collect(),
            settling,
            pending_evictions,
            pending_writes: self.pending_writes.len(),
        }
    }
}

async fn run_sweep(store: &dyn Store, plan: SweepPlan) -> SweepOutcome {
    let stale_online = if plan.list_online {
        Some(store.list_online().await)
    } else {
        None
    };

    let mut evictions = Vec::with_capacity(plan.evict.len());
    for identity_id in plan.evict {
        evictions.push((identity_id, store.delete_identity(identity_id).await));
    }

    let mut writes = Vec::with_capacity(plan.writes.len());
    for record in plan.writes {
        let result = store
            .set_presence(record.identity_id, record.is_online, record.last_seen)
            .await;
        writes.push((record, result));
    }

    SweepOutcome {
        stale_online,
        evictions,
        writes,
    }
}
