mod command;
mod error;
mod idempotency;
pub mod ledger;
pub mod lifecycle;
mod mutations;
mod queries;
pub mod session;
pub mod strikes;
pub mod waitlist;

pub use command::{AttendanceOutcome, CancelOutcome, Command, EnrollOutcome, Outcome};
pub use error::EngineError;
pub use session::ClassState;
pub use strikes::{StrikeHistory, StrikePolicy};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::config::PolicyConfig;
use crate::limits::MAX_STALE_RETRIES;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

use idempotency::IdempotencyCache;

pub type SharedClassState = Arc<RwLock<ClassState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        commit: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        commits: Vec<Vec<Event>>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first append, drains whatever else is already queued,
/// then pays for one fsync for the whole batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let mut batch = match cmd {
            WalCommand::Append { commit, response } => vec![(commit, response)],
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { commit, response }) => batch.push((commit, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        respond_batch(batch, &result);

        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err = None;
    for (commit, _) in batch {
        if let Err(e) = wal.append_buffered(commit) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so partial bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match append_err.or(flush_err) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn respond_batch(batch: Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { commits, response } => {
            let result = Wal::write_compact_file(wal.path(), &commits)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// The booking engine: per-session state, strike policy, durability.
pub struct Engine {
    pub(super) classes: DashMap<Ulid, SharedClassState>,
    /// Reverse lookup: booking id → class id.
    pub(super) booking_index: DashMap<Ulid, Ulid>,
    pub(super) strikes: StrikePolicy,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) idempotency: IdempotencyCache,
    /// Logical clock for waitlist ordering; survives restarts through the WAL.
    pub(super) clock: AtomicU64,
    /// Mutations hold this shared; compaction holds it exclusively so the
    /// snapshot it writes cannot miss an in-flight commit.
    pub(super) commit_gate: RwLock<()>,
}

/// Apply a class-scoped event. Caller holds the class write lock.
fn apply_to_class(cs: &mut ClassState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::CapacityChanged { capacity, .. } => {
            if let Err(e) = cs.seats.set_capacity(*capacity) {
                warn!("class {}: ignoring capacity change: {e}", cs.id);
            }
        }
        Event::ClassRemoved { .. } => {
            cs.removed = true;
            for id in cs.bookings.keys() {
                index.remove(id);
            }
        }
        Event::BookingReserved { id, class_id, user_id, at } => {
            if !cs.seats.try_admit() {
                warn!("class {class_id}: reservation {id} applied without a free seat");
            }
            cs.insert_record(BookingRecord::new(
                *id,
                *class_id,
                user_id.clone(),
                BookingStatus::Reserved,
                StatusReason::Enrolled,
                *at,
            ));
            index.insert(*id, *class_id);
        }
        Event::WaitlistJoined { id, class_id, user_id, at, joined_at } => {
            if let Err(e) = cs.waitlist.enqueue(*class_id, user_id.clone(), *id, *joined_at) {
                warn!("class {class_id}: {e}");
            }
            cs.insert_record(BookingRecord::new(
                *id,
                *class_id,
                user_id.clone(),
                BookingStatus::Waitlist,
                StatusReason::Waitlisted,
                *at,
            ));
            index.insert(*id, *class_id);
        }
        Event::WaitlistPromoted { id, class_id, at } => {
            let Some(record) = cs.bookings.get_mut(id) else {
                warn!("class {class_id}: promotion of unknown booking {id}");
                return;
            };
            cs.waitlist.remove(&record.user_id);
            if !cs.seats.try_admit() {
                warn!("class {class_id}: promotion {id} applied without a free seat");
            }
            record.set_status(BookingStatus::Reserved, StatusReason::Promoted, *at);
        }
        Event::BookingCancelled { id, class_id, at, reason } => {
            let Some(record) = cs.bookings.get_mut(id) else {
                warn!("class {class_id}: cancellation of unknown booking {id}");
                return;
            };
            match record.status {
                BookingStatus::Reserved => cs.seats.release(),
                BookingStatus::Waitlist => {
                    cs.waitlist.remove(&record.user_id);
                }
                _ => {}
            }
            record.set_status(BookingStatus::Cancelled, *reason, *at);
        }
        Event::AttendanceMarked { id, status, at, reason, .. } => {
            if let Some(record) = cs.bookings.get_mut(id) {
                record.set_status(*status, *reason, *at);
            }
        }
        Event::BookingRestored { record, joined_at } => {
            if record.status.holds_seat() && !cs.seats.try_admit() {
                warn!("class {}: restored booking {} exceeds capacity", cs.id, record.id);
            }
            if record.status == BookingStatus::Waitlist
                && let Some(joined_at) = joined_at
                && let Err(e) =
                    cs.waitlist.enqueue(cs.id, record.user_id.clone(), record.id, *joined_at)
            {
                warn!("class {}: {e}", cs.id);
            }
            index.insert(record.id, record.class_id);
            cs.insert_record(record.clone());
        }
        // Class creation and strikes are handled outside the class lock.
        Event::ClassScheduled { .. }
        | Event::StrikeRecorded { .. }
        | Event::StrikesRestored { .. } => {}
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        config: PolicyConfig,
        notify: Arc<NotifyHub>,
    ) -> io::Result<Self> {
        let (wal, replay) = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            classes: DashMap::new(),
            booking_index: DashMap::new(),
            strikes: StrikePolicy::new(config),
            wal_tx,
            notify,
            idempotency: IdempotencyCache::new(),
            clock: AtomicU64::new(1),
            commit_gate: RwLock::new(()),
        };

        // We're the sole owner of every lock here, so try_* always succeeds.
        // Never use blocking_* since this may run inside an async context.
        for event in replay.commits.iter().flatten() {
            engine.replay_event(event)?;
        }
        info!(
            "replayed {} events in {} commits from {}",
            replay.event_count(),
            replay.commits.len(),
            wal_path.display()
        );
        Ok(engine)
    }

    fn replay_event(&self, event: &Event) -> io::Result<()> {
        let contended = |what: &str| io::Error::other(format!("replay: contended {what} lock"));
        match event {
            Event::ClassScheduled { id, site_id, name, starts_at, ends_at, capacity } => {
                let cs = ClassState::new(*id, *site_id, name.clone(), *starts_at, *ends_at, *capacity);
                self.classes.insert(*id, Arc::new(RwLock::new(cs)));
            }
            Event::StrikeRecorded { user_id, kind, at, class_id, restriction_until } => {
                let handle = self.strikes.history_handle(user_id);
                let mut history = handle.try_lock().map_err(|_| contended("strike"))?;
                self.strikes
                    .apply_recorded(&mut history, user_id, *kind, *at, *class_id, *restriction_until);
            }
            Event::StrikesRestored { user_id, events, restriction_until } => {
                let handle = self.strikes.history_handle(user_id);
                let mut history = handle.try_lock().map_err(|_| contended("strike"))?;
                self.strikes.apply_restored(&mut history, user_id, events, *restriction_until);
            }
            other => {
                if let Event::WaitlistJoined { joined_at, .. }
                | Event::BookingRestored { joined_at: Some(joined_at), .. } = other
                {
                    self.clock.fetch_max(joined_at + 1, Ordering::SeqCst);
                }
                let Some(class_id) = other.class_id() else {
                    return Ok(());
                };
                let Some(rs) = self.get_class(&class_id) else {
                    debug!("replay: skipping event for unknown class {class_id}");
                    return Ok(());
                };
                let mut guard = rs.try_write().map_err(|_| contended("class"))?;
                apply_to_class(&mut guard, other, &self.booking_index);
                if guard.removed {
                    drop(guard);
                    self.classes.remove(&class_id);
                }
            }
        }
        Ok(())
    }

    pub fn config(&self) -> &PolicyConfig {
        self.strikes.config()
    }

    pub fn strike_policy(&self) -> &StrikePolicy {
        &self.strikes
    }

    /// Next tick of the waitlist logical clock.
    pub(super) fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst)
    }

    /// Write one commit via the background group-commit writer.
    async fn wal_append(&self, commit: &[Event]) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                commit: commit.to_vec(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_class(&self, id: &Ulid) -> Option<SharedClassState> {
        self.classes.get(id).map(|e| e.value().clone())
    }

    pub fn class_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_index.get(booking_id).map(|e| *e.value())
    }

    /// Persist a commit, then apply it. Nothing is applied if the WAL write
    /// fails, so a failed promotion leaves the seat and the waitlist as they were.
    pub(super) async fn commit(
        &self,
        cs: &mut ClassState,
        mut strikes: Option<&mut StrikeHistory>,
        events: Vec<Event>,
    ) -> Result<(), EngineError> {
        self.wal_append(&events).await?;
        for event in &events {
            match event {
                Event::StrikeRecorded { user_id, kind, at, class_id, restriction_until } => {
                    match strikes.as_deref_mut() {
                        Some(history) => self.strikes.apply_recorded(
                            history,
                            user_id,
                            *kind,
                            *at,
                            *class_id,
                            *restriction_until,
                        ),
                        None => warn!("strike for {user_id} committed without its history lock"),
                    }
                }
                other => apply_to_class(cs, other, &self.booking_index),
            }
        }
        Ok(())
    }

    /// Write-lock a class, re-resolving if it was removed while we waited.
    pub(super) async fn lock_class(
        &self,
        class_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ClassState>, EngineError> {
        for attempt in 0..MAX_STALE_RETRIES {
            let rs = self
                .get_class(&class_id)
                .ok_or(EngineError::ClassNotFound(class_id))?;
            let guard = rs.write_owned().await;
            if !guard.removed {
                return Ok(guard);
            }
            metrics::counter!(crate::observability::STALE_RETRIES_TOTAL).increment(1);
            debug!("class {class_id} went stale (attempt {attempt}), re-resolving");
            drop(guard);
            tokio::task::yield_now().await;
        }
        Err(EngineError::StaleWrite(class_id))
    }

    /// Resolve a booking to its class and write-lock that class.
    pub(super) async fn lock_booking(
        &self,
        booking_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ClassState>, EngineError> {
        let class_id = self
            .class_for_booking(&booking_id)
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        let guard = match self.lock_class(class_id).await {
            Err(EngineError::ClassNotFound(_)) => {
                return Err(EngineError::BookingNotFound(booking_id));
            }
            other => other?,
        };
        if !guard.bookings.contains_key(&booking_id) {
            return Err(EngineError::BookingNotFound(booking_id));
        }
        Ok(guard)
    }
}
