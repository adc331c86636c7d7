use std::sync::Arc;

use tokio::sync::{RwLock, oneshot};
use tracing::{debug, error, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::Notification;

use super::lifecycle::{check_transition, Transition};
use super::{
    AttendanceOutcome, CancelOutcome, ClassState, Engine, EngineError, EnrollOutcome, WalCommand,
};

fn validate_user_id(user_id: &str) -> Result<(), EngineError> {
    if user_id.is_empty() {
        return Err(EngineError::LimitExceeded("empty user id"));
    }
    if user_id.len() > MAX_USER_ID_LEN {
        return Err(EngineError::LimitExceeded("user id too long"));
    }
    Ok(())
}

/// Plan promotions for every free seat, earliest-joined first.
fn plan_promotions(cs: &ClassState, free: u32, now: Ms) -> (Vec<Event>, Vec<WaitlistPromotionInfo>) {
    let mut events = Vec::new();
    let mut infos = Vec::new();
    if check_transition(BookingStatus::Waitlist, Transition::Promote, cs.window(), now).is_err() {
        return (events, infos);
    }
    for entry in cs.waitlist.iter().take(free as usize) {
        events.push(Event::WaitlistPromoted {
            id: entry.booking_id,
            class_id: cs.id,
            at: now,
        });
        infos.push(WaitlistPromotionInfo {
            promoted: true,
            class_id: cs.id,
            promoted_user_id: entry.user_id.clone(),
            booking_id: entry.booking_id,
        });
    }
    (events, infos)
}

impl Engine {
    fn announce_promotions(&self, promotions: &[WaitlistPromotionInfo]) {
        for p in promotions {
            info!("promoted {} from waitlist into class {}", p.promoted_user_id, p.class_id);
            metrics::counter!(crate::observability::PROMOTIONS_TOTAL).increment(1);
            self.notify.send(&Notification::Promoted(p.clone()));
        }
    }

    fn announce_strike(&self, alert: &StrikeAlert, restricted_now: bool) {
        if restricted_now {
            metrics::counter!(crate::observability::RESTRICTIONS_TOTAL).increment(1);
        }
        info!(
            "strike {} for {}: {}/{} restricted={}",
            alert.kind.as_str(),
            alert.user_id,
            alert.strikes,
            alert.threshold,
            alert.is_restricted
        );
        metrics::counter!(crate::observability::STRIKES_TOTAL, "kind" => alert.kind.as_str())
            .increment(1);
        self.notify.send(&Notification::Strike(alert.clone()));
    }

    // ── Scheduling collaborator ──────────────────────────────

    pub async fn schedule_class(
        &self,
        id: Ulid,
        site_id: u32,
        name: Option<String>,
        starts_at: Ms,
        duration_ms: Ms,
        capacity: u32,
    ) -> Result<(), EngineError> {
        if capacity == 0 {
            return Err(EngineError::LimitExceeded("capacity must be positive"));
        }
        if capacity > MAX_CAPACITY {
            return Err(EngineError::LimitExceeded("capacity too large"));
        }
        if duration_ms <= 0 || duration_ms > MAX_SESSION_DURATION_MS {
            return Err(EngineError::LimitExceeded("session duration out of range"));
        }
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("class name too long"));
        }
        let ends_at = match starts_at.checked_add(duration_ms) {
            Some(end) if starts_at >= MIN_TIMESTAMP_MS && end <= MAX_TIMESTAMP_MS => end,
            _ => return Err(EngineError::LimitExceeded("timestamp out of range")),
        };
        if self.classes.len() >= MAX_CLASSES {
            return Err(EngineError::LimitExceeded("too many classes"));
        }

        let _gate = self.commit_gate.read().await;
        if self.classes.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let event = Event::ClassScheduled {
            id,
            site_id,
            name: name.clone(),
            starts_at,
            ends_at,
            capacity,
        };
        self.wal_append(std::slice::from_ref(&event)).await?;
        let cs = ClassState::new(id, site_id, name, starts_at, ends_at, capacity);
        self.classes.insert(id, Arc::new(RwLock::new(cs)));
        info!("scheduled class {id} at site {site_id} with {capacity} seats");
        Ok(())
    }

    /// Change a session's capacity. Growth hands the new seats to the
    /// waitlist in the same commit.
    pub async fn update_capacity(
        &self,
        class_id: Ulid,
        capacity: u32,
        now: Ms,
    ) -> Result<Vec<WaitlistPromotionInfo>, EngineError> {
        if capacity > MAX_CAPACITY {
            return Err(EngineError::LimitExceeded("capacity too large"));
        }
        let _gate = self.commit_gate.read().await;
        let mut guard = self.lock_class(class_id).await?;
        let mut seats = guard.seats;
        seats.set_capacity(capacity)?;

        let (promotions, infos) = plan_promotions(&guard, seats.free(), now);
        let mut events = vec![Event::CapacityChanged { id: class_id, capacity }];
        events.extend(promotions);
        self.commit(&mut guard, None, events).await?;
        drop(guard);

        self.announce_promotions(&infos);
        Ok(infos)
    }

    /// Remove a session that no longer has RESERVED or WAITLIST bookings.
    pub async fn remove_class(&self, class_id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut guard = self.lock_class(class_id).await?;
        if guard.has_active_bookings() {
            return Err(EngineError::ClassInUse(class_id));
        }
        self.commit(&mut guard, None, vec![Event::ClassRemoved { id: class_id }])
            .await?;
        drop(guard);
        self.classes.remove(&class_id);
        info!("removed class {class_id}");
        Ok(())
    }

    // ── Booking operations ───────────────────────────────────

    /// Admit a user, or queue them when the session is full.
    pub async fn enroll(
        &self,
        user_id: &str,
        class_id: Ulid,
        now: Ms,
    ) -> Result<EnrollOutcome, EngineError> {
        validate_user_id(user_id)?;
        let _gate = self.commit_gate.read().await;
        let mut guard = self.lock_class(class_id).await?;

        if let Some(until) = self.strikes.restriction_until(user_id, now) {
            metrics::counter!(crate::observability::ENROLLMENTS_TOTAL, "outcome" => "restricted")
                .increment(1);
            return Err(EngineError::RestrictedUser { until });
        }
        let mut has_tombstone = false;
        for record in guard.records_for(user_id) {
            match record.status {
                BookingStatus::Reserved | BookingStatus::Attended | BookingStatus::Absent => {
                    return Err(EngineError::AlreadyEnrolled(class_id));
                }
                BookingStatus::Waitlist => return Err(EngineError::AlreadyWaitlisted(class_id)),
                BookingStatus::Cancelled => has_tombstone = true,
            }
        }
        if has_tombstone && self.config().block_reenroll_after_cancel {
            return Err(EngineError::AlreadyCancelledOnce(class_id));
        }
        if guard.has_started(now) {
            return Err(EngineError::ClassClosed(class_id));
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_CLASS {
            return Err(EngineError::LimitExceeded("too many bookings on class"));
        }

        let id = Ulid::new();
        let user_id = user_id.to_string();
        if guard.seats.has_free() {
            let event = Event::BookingReserved { id, class_id, user_id: user_id.clone(), at: now };
            self.commit(&mut guard, None, vec![event]).await?;
            metrics::counter!(crate::observability::ENROLLMENTS_TOTAL, "outcome" => "reserved")
                .increment(1);
            info!("{user_id} reserved a seat in class {class_id}");
            return Ok(EnrollOutcome::Reserved { booking: guard.bookings[&id].clone() });
        }

        if guard.waitlist.len() >= MAX_WAITLIST_PER_CLASS {
            metrics::counter!(crate::observability::ENROLLMENTS_TOTAL, "outcome" => "full")
                .increment(1);
            return Err(EngineError::CapacityFull(class_id));
        }
        let joined_at = self.tick();
        let event = Event::WaitlistJoined { id, class_id, user_id: user_id.clone(), at: now, joined_at };
        self.commit(&mut guard, None, vec![event]).await?;
        let position = guard.waitlist.position_of(&user_id).unwrap_or(guard.waitlist.len());
        metrics::counter!(crate::observability::ENROLLMENTS_TOTAL, "outcome" => "waitlisted")
            .increment(1);
        info!("{user_id} waitlisted for class {class_id} at position {position}");
        Ok(EnrollOutcome::Waitlisted {
            booking: guard.bookings[&id].clone(),
            waitlisted: true,
            position,
        })
    }

    /// Cancel a reservation (releasing and re-filling the seat in one commit)
    /// or leave the waitlist.
    pub async fn cancel(
        &self,
        user_id: &str,
        class_id: Ulid,
        now: Ms,
    ) -> Result<CancelOutcome, EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut guard = self.lock_class(class_id).await?;
        let record = guard
            .active_for(user_id)
            .cloned()
            .ok_or(EngineError::NotEnrolled(class_id))?;

        if record.status == BookingStatus::Waitlist {
            let booking = self.leave_locked(&mut guard, &record, now).await?;
            return Ok(CancelOutcome { booking, waitlist_promotion: None, strike_alert: None });
        }

        check_transition(record.status, Transition::Cancel, guard.window(), now)?;
        let late = self.config().is_late_cancellation(guard.starts_at, now);
        let reason = if late {
            StatusReason::LateCancellation
        } else {
            StatusReason::Cancelled
        };
        let mut events = vec![Event::BookingCancelled { id: record.id, class_id, at: now, reason }];

        // The released seat goes straight to the head of the waitlist.
        let (promotions, mut infos) = plan_promotions(&guard, 1, now);
        events.extend(promotions);

        let mut history = None;
        let mut strike_alert = None;
        let mut restricted_now = false;
        if late {
            let locked = self.strikes.lock_user(user_id).await;
            let (alert, newly) =
                self.strikes.preview_event(&locked, user_id, StrikeKind::LateCancellation, now);
            events.push(Event::StrikeRecorded {
                user_id: user_id.to_string(),
                kind: StrikeKind::LateCancellation,
                at: now,
                class_id,
                restriction_until: newly,
            });
            history = Some(locked);
            strike_alert = Some(alert);
            restricted_now = newly.is_some();
        }

        self.commit(&mut guard, history.as_deref_mut(), events).await?;
        let booking = guard.bookings[&record.id].clone();
        drop(history);
        drop(guard);

        metrics::counter!(crate::observability::CANCELLATIONS_TOTAL, "late" => if late { "true" } else { "false" })
            .increment(1);
        info!("{user_id} cancelled booking {} in class {class_id} (late={late})", record.id);
        self.announce_promotions(&infos);
        if let Some(alert) = &strike_alert {
            self.announce_strike(alert, restricted_now);
        }
        Ok(CancelOutcome {
            booking,
            waitlist_promotion: infos.pop(),
            strike_alert,
        })
    }

    pub async fn leave_waitlist(
        &self,
        user_id: &str,
        class_id: Ulid,
        now: Ms,
    ) -> Result<BookingRecord, EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut guard = self.lock_class(class_id).await?;
        let record = guard
            .records_for(user_id)
            .find(|r| r.status == BookingStatus::Waitlist)
            .cloned()
            .ok_or(EngineError::NotEnrolled(class_id))?;
        self.leave_locked(&mut guard, &record, now).await
    }

    async fn leave_locked(
        &self,
        guard: &mut ClassState,
        record: &BookingRecord,
        now: Ms,
    ) -> Result<BookingRecord, EngineError> {
        check_transition(record.status, Transition::LeaveWaitlist, guard.window(), now)?;
        let event = Event::BookingCancelled {
            id: record.id,
            class_id: record.class_id,
            at: now,
            reason: Transition::LeaveWaitlist.reason(),
        };
        self.commit(guard, None, vec![event]).await?;
        debug!("{} left the waitlist of class {}", record.user_id, record.class_id);
        Ok(guard.bookings[&record.id].clone())
    }

    /// User self check-in.
    pub async fn check_in(&self, booking_id: Ulid, now: Ms) -> Result<BookingRecord, EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut guard = self.lock_booking(booking_id).await?;
        let record = guard.bookings[&booking_id].clone();
        let status = check_transition(record.status, Transition::CheckIn, guard.window(), now)?;
        let event = Event::AttendanceMarked {
            id: booking_id,
            class_id: record.class_id,
            status,
            at: now,
            reason: Transition::CheckIn.reason(),
        };
        self.commit(&mut guard, None, vec![event]).await?;
        metrics::counter!(crate::observability::ATTENDANCE_TOTAL, "status" => status.as_str())
            .increment(1);
        Ok(guard.bookings[&booking_id].clone())
    }

    /// Admin attendance mark. ABSENT records a strike in the same commit.
    pub async fn mark_attendance(
        &self,
        booking_id: Ulid,
        status: BookingStatus,
        now: Ms,
    ) -> Result<AttendanceOutcome, EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut guard = self.lock_booking(booking_id).await?;
        let record = guard.bookings[&booking_id].clone();
        let transition = match status {
            BookingStatus::Attended => Transition::MarkAttended,
            BookingStatus::Absent => Transition::MarkAbsent,
            to => return Err(EngineError::InvalidStatusTransition { from: record.status, to }),
        };
        check_transition(record.status, transition, guard.window(), now)?;

        let mut events = vec![Event::AttendanceMarked {
            id: booking_id,
            class_id: record.class_id,
            status,
            at: now,
            reason: transition.reason(),
        }];
        let mut history = None;
        let mut strike_alert = None;
        let mut restricted_now = false;
        if status == BookingStatus::Absent {
            let locked = self.strikes.lock_user(&record.user_id).await;
            let (alert, newly) =
                self.strikes.preview_event(&locked, &record.user_id, StrikeKind::Absence, now);
            events.push(Event::StrikeRecorded {
                user_id: record.user_id.clone(),
                kind: StrikeKind::Absence,
                at: now,
                class_id: record.class_id,
                restriction_until: newly,
            });
            history = Some(locked);
            strike_alert = Some(alert);
            restricted_now = newly.is_some();
        }

        self.commit(&mut guard, history.as_deref_mut(), events).await?;
        let booking = guard.bookings[&booking_id].clone();
        drop(history);
        drop(guard);

        metrics::counter!(crate::observability::ATTENDANCE_TOTAL, "status" => status.as_str())
            .increment(1);
        if let Some(alert) = &strike_alert {
            self.announce_strike(alert, restricted_now);
        }
        Ok(AttendanceOutcome { booking, strike_alert })
    }

    /// Fill any free seat that still has someone waiting for it. Normally a
    /// no-op: cancellations and capacity changes promote in their own commit.
    pub async fn reconcile_waitlists(&self, now: Ms) -> Vec<WaitlistPromotionInfo> {
        let mut promoted = Vec::new();
        let class_ids: Vec<Ulid> = self.classes.iter().map(|e| *e.key()).collect();
        for class_id in class_ids {
            let _gate = self.commit_gate.read().await;
            let Ok(mut guard) = self.lock_class(class_id).await else {
                continue;
            };
            if guard.waitlist.is_empty() || !guard.seats.has_free() {
                continue;
            }
            let (events, infos) = plan_promotions(&guard, guard.seats.free(), now);
            if events.is_empty() {
                continue;
            }
            if let Err(e) = self.commit(&mut guard, None, events).await {
                error!("reconcile of class {class_id} failed: {e}");
                continue;
            }
            drop(guard);
            self.announce_promotions(&infos);
            promoted.extend(infos);
        }
        promoted
    }

    // ── Compaction ───────────────────────────────────────────

    /// Rewrite the WAL as the minimal set of commits that recreates the
    /// current state. Strike history outside the rolling window is dropped.
    pub async fn compact_wal(&self, now: Ms) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let mut commits = Vec::new();

        let mut class_ids: Vec<Ulid> = self.classes.iter().map(|e| *e.key()).collect();
        class_ids.sort();
        for class_id in class_ids {
            let Some(rs) = self.get_class(&class_id) else {
                continue;
            };
            let guard = rs.read().await;
            if guard.removed {
                continue;
            }
            let mut commit = vec![Event::ClassScheduled {
                id: guard.id,
                site_id: guard.site_id,
                name: guard.name.clone(),
                starts_at: guard.starts_at,
                ends_at: guard.ends_at,
                capacity: guard.seats.capacity(),
            }];
            let mut records: Vec<&BookingRecord> = guard.bookings.values().collect();
            records.sort_by_key(|r| (r.created_at, r.id));
            for record in records {
                commit.push(Event::BookingRestored {
                    record: record.clone(),
                    joined_at: guard.waitlist.joined_at_of(&record.user_id).filter(|_| {
                        record.status == BookingStatus::Waitlist
                    }),
                });
            }
            commits.push(commit);
        }

        let cutoff = now.saturating_sub(self.config().window_ms());
        for (user_id, handle) in self.strikes.user_histories() {
            let mut history = handle.lock().await;
            history.prune_before(cutoff);
            if history.is_empty() {
                continue;
            }
            commits.push(vec![Event::StrikesRestored {
                user_id,
                events: history.events().to_vec(),
                restriction_until: history.restriction_until(),
            }]);
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { commits, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
        Ok(())
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
}
