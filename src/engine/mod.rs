mod calendar;
mod error;
mod lifecycle;
mod stats;
mod store;

pub use calendar::{check_confirm, check_request, is_free, validate_span};
pub use error::EngineError;
pub use stats::{aggregate, AggregateStat, PeakHour};

use std::io;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::warn;

use crate::config::EngineConfig;
use crate::directory::ResourceDirectory;
use crate::model::*;
use crate::notify::{NotificationSink, Severity};
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

pub fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL file. Waits for one append, drains whatever else is already
/// queued, then commits the whole batch with a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    // Commit what we have before compaction sees the file.
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let mut staged = Ok(());
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            staged = Err(e);
            break;
        }
    }
    // The whole batch commits or none of it does.
    let result = match staged {
        Ok(()) => wal.flush_sync(),
        Err(e) => {
            wal.discard_staged();
            Err(e)
        }
    };

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// Apply an event to a resource's state. The caller holds the write lock.
fn apply_to_resource(rs: &mut ResourceState, event: &Event) {
    match event {
        Event::ReservationCreated(reservation) => rs.insert(reservation.clone()),
        Event::StatusChanged { id, status, .. } => {
            if let Some(r) = rs.get_mut(*id) {
                r.status = *status;
            }
        }
    }
}

/// Write access to one resource plus a shared hold on the commit gate.
pub(super) struct ResourceLock {
    guard: OwnedRwLockWriteGuard<ResourceState>,
    _gate: OwnedRwLockReadGuard<()>,
}

impl Deref for ResourceLock {
    type Target = ResourceState;

    fn deref(&self) -> &ResourceState {
        &self.guard
    }
}

impl DerefMut for ResourceLock {
    fn deref_mut(&mut self) -> &mut ResourceState {
        &mut self.guard
    }
}

/// Reservation engine: the store, the calendar and the lifecycle controller
/// over one WAL.
///
/// Every mutation of a resource's reservations runs while holding that
/// resource's write lock, from the conflict check through the WAL commit.
pub struct Engine {
    pub(super) state: DashMap<ResourceId, SharedResourceState>,
    /// Reverse lookup: reservation id → resource id.
    pub(super) reservation_index: DashMap<ReservationId, ResourceId>,
    next_id: AtomicU64,
    /// Writers share it (always before a resource lock); compaction takes it exclusively.
    commit_gate: Arc<RwLock<()>>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) directory: Arc<dyn ResourceDirectory>,
    notifier: Arc<dyn NotificationSink>,
    pub(super) config: EngineConfig,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        directory: Arc<dyn ResourceDirectory>,
        notifier: Arc<dyn NotificationSink>,
        config: EngineConfig,
    ) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            reservation_index: DashMap::new(),
            next_id: AtomicU64::new(1),
            commit_gate: Arc::new(RwLock::new(())),
            wal_tx,
            directory,
            notifier,
            config,
        };

        // Sole owner of every Arc during replay, so try_write never contends.
        // blocking_write would panic here: this may run inside the runtime.
        let mut max_id = 0;
        for event in &events {
            let rs = engine.resource_entry(event.resource_id());
            let mut guard = rs
                .try_write()
                .map_err(|_| io::Error::other("replay: resource state contended"))?;
            if let Event::ReservationCreated(r) = event {
                engine.reservation_index.insert(r.id, r.resource_id);
                max_id = max_id.max(r.id);
            }
            apply_to_resource(&mut guard, event);
        }
        engine.next_id.store(max_id + 1, Ordering::SeqCst);
        if !events.is_empty() {
            tracing::info!(
                "replayed {} events, {} reservations",
                events.len(),
                engine.reservation_index.len()
            );
        }

        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(super) fn allocate_id(&self) -> ReservationId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn get_resource(&self, id: &ResourceId) -> Option<SharedResourceState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    /// Resource state, created empty on first use.
    pub(super) fn resource_entry(&self, id: ResourceId) -> SharedResourceState {
        self.state
            .entry(id)
            .or_insert_with(|| Arc::new(RwLock::new(ResourceState::new(id))))
            .value()
            .clone()
    }

    pub fn resource_for_reservation(&self, id: &ReservationId) -> Option<ResourceId> {
        self.reservation_index.get(id).map(|e| *e.value())
    }

    /// Exclusive lock on one resource, bounded by the write deadline.
    pub(super) async fn lock_resource(
        &self,
        resource_id: ResourceId,
    ) -> Result<ResourceLock, EngineError> {
        let rs = self.resource_entry(resource_id);
        let gate = self.commit_gate.clone();
        let acquire = async move {
            let gate = gate.read_owned().await;
            let guard = rs.write_owned().await;
            ResourceLock { guard, _gate: gate }
        };
        tokio::time::timeout(self.config.write_timeout, acquire)
            .await
            .map_err(|_| {
                warn!(resource_id, "timed out waiting for resource lock");
                EngineError::Persistence(format!("lock wait on resource {resource_id} timed out"))
            })
    }

    /// Find the reservation's resource and lock it.
    pub(super) async fn lock_for_reservation(
        &self,
        id: ReservationId,
    ) -> Result<(ResourceId, ResourceLock), EngineError> {
        let resource_id = self
            .resource_for_reservation(&id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = self.lock_resource(resource_id).await?;
        Ok((resource_id, guard))
    }

    /// Write an event through the group-commit writer.
    ///
    /// The write deadline bounds only the wait for room in the writer's queue.
    /// Once queued the event may be committed at any moment, so the caller waits
    /// for the writer's verdict: an error here always means nothing reached the log.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        let command = WalCommand::Append {
            event: event.clone(),
            response: tx,
        };
        match tokio::time::timeout(self.config.write_timeout, self.wal_tx.send(command)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(EngineError::Persistence("WAL writer shut down".into())),
            Err(_) => return Err(EngineError::Persistence("WAL queue full, commit timed out".into())),
        }
        rx.await
            .map_err(|_| EngineError::Persistence("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Persistence(e.to_string()))
    }

    /// WAL-append then apply. Nothing is applied in memory unless the append committed.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut ResourceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        if let Err(e) = self.wal_append(event).await {
            tracing::error!(resource_id = rs.id, "WAL append failed: {e}");
            return Err(e);
        }
        if let Event::ReservationCreated(r) = event {
            self.reservation_index.insert(r.id, r.resource_id);
        }
        apply_to_resource(rs, event);
        Ok(())
    }

    /// Deliver a notification; a failing sink never fails the caller.
    pub(super) fn notify(&self, user_id: UserId, message: &str, severity: Severity) {
        if let Err(e) = self.notifier.notify(user_id, message, severity) {
            warn!("{e}");
        }
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Rewrite the WAL as one `ReservationCreated` per reservation carrying its
    /// current status. Cancelled and rejected records are kept.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // With the gate held exclusively no writer is mid-mutation, and none can
        // append to the old file until the compacted one is swapped in.
        let _gate = self.commit_gate.write().await;
        let mut resource_ids: Vec<ResourceId> = self.state.iter().map(|e| *e.key()).collect();
        resource_ids.sort_unstable();
        let mut guards = Vec::with_capacity(resource_ids.len());
        for rid in resource_ids {
            if let Some(rs) = self.get_resource(&rid) {
                guards.push(rs.read_owned().await);
            }
        }
        let events: Vec<Event> = guards
            .iter()
            .flat_map(|g| g.reservations.iter().cloned().map(Event::ReservationCreated))
            .collect();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Persistence("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Persistence("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Persistence(e.to_string()))
    }
}
