use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use ulid::Ulid;

use crate::config::PolicyConfig;
use crate::model::*;

/// One user's strike events (sorted by time) and restriction state.
#[derive(Debug, Clone, Default)]
pub struct StrikeHistory {
    events: Vec<StrikeEvent>,
    restriction_until: Option<Ms>,
}

impl StrikeHistory {
    pub fn events(&self) -> &[StrikeEvent] {
        &self.events
    }

    pub fn restriction_until(&self) -> Option<Ms> {
        self.restriction_until
    }

    /// Events with `start <= at <= end`.
    pub fn count_between(&self, start: Ms, end: Ms) -> u32 {
        let lo = self.events.partition_point(|e| e.at < start);
        let hi = self.events.partition_point(|e| e.at <= end);
        hi.saturating_sub(lo) as u32
    }

    fn active_restriction(&self, now: Ms) -> Option<Ms> {
        self.restriction_until.filter(|until| now < *until)
    }

    fn push(&mut self, event: StrikeEvent) {
        let pos = self.events.partition_point(|e| e.at <= event.at);
        self.events.insert(pos, event);
    }

    /// Drop events that can no longer fall inside any future window.
    pub fn prune_before(&mut self, cutoff: Ms) {
        let keep_from = self.events.partition_point(|e| e.at < cutoff);
        self.events.drain(..keep_from);
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.restriction_until.is_none()
    }
}

/// Rolling-window strike accounting keyed by user.
///
/// Writers take the per-user mutex (always after any class lock) and keep it
/// across the WAL commit, so two strikes for the same user never evaluate
/// against the same history. `restrictions` mirrors each user's
/// `restriction_until` for lock-free `is_restricted` reads.
pub struct StrikePolicy {
    config: PolicyConfig,
    users: DashMap<UserId, Arc<Mutex<StrikeHistory>>>,
    restrictions: DashMap<UserId, Ms>,
}

impl StrikePolicy {
    pub fn new(config: PolicyConfig) -> Self {
        Self {
            config,
            users: DashMap::new(),
            restrictions: DashMap::new(),
        }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Lock a user's history for a read-evaluate-commit cycle.
    pub async fn lock_user(&self, user_id: &str) -> OwnedMutexGuard<StrikeHistory> {
        let history = self
            .users
            .entry(user_id.to_string())
            .or_default()
            .value()
            .clone();
        history.lock_owned().await
    }

    /// Compute the alert `kind` at `at` would produce, without recording it.
    /// The second value is the restriction to start, if this event trips one.
    pub fn preview_event(
        &self,
        history: &StrikeHistory,
        user_id: &str,
        kind: StrikeKind,
        at: Ms,
    ) -> (StrikeAlert, Option<Ms>) {
        let threshold = self.config.strike_threshold;
        let strikes = history.count_between(at.saturating_sub(self.config.window_ms()), at) + 1;
        let (restriction_until, newly) = match history.active_restriction(at) {
            Some(until) => (Some(until), None),
            None if strikes >= threshold => {
                let until = at.saturating_add(self.config.restriction_ms());
                (Some(until), Some(until))
            }
            None => (None, None),
        };
        let alert = StrikeAlert {
            kind,
            user_id: user_id.to_string(),
            strikes,
            threshold,
            is_restricted: restriction_until.is_some(),
            restriction_until,
        };
        (alert, newly)
    }

    /// Apply a committed strike to a locked history.
    pub fn apply_recorded(
        &self,
        history: &mut StrikeHistory,
        user_id: &str,
        kind: StrikeKind,
        at: Ms,
        class_id: Ulid,
        restriction_until: Option<Ms>,
    ) {
        history.push(StrikeEvent { kind, at, class_id });
        if let Some(until) = restriction_until {
            history.restriction_until = Some(until);
            self.restrictions.insert(user_id.to_string(), until);
        }
    }

    /// Replace a locked history wholesale (compaction replay).
    pub fn apply_restored(
        &self,
        history: &mut StrikeHistory,
        user_id: &str,
        events: &[StrikeEvent],
        restriction_until: Option<Ms>,
    ) {
        history.events = events.to_vec();
        history.events.sort_by_key(|e| e.at);
        history.restriction_until = restriction_until;
        match restriction_until {
            Some(until) => {
                self.restrictions.insert(user_id.to_string(), until);
            }
            None => {
                self.restrictions.remove(user_id);
            }
        }
    }

    /// Record and commit in memory only. The engine goes through
    /// `preview_event` + WAL + `apply_recorded` instead; this is for callers that
    /// own their own durability.
    pub async fn record_event(
        &self,
        user_id: &str,
        kind: StrikeKind,
        at: Ms,
        class_id: Ulid,
    ) -> StrikeAlert {
        let mut history = self.lock_user(user_id).await;
        let (alert, newly) = self.preview_event(&history, user_id, kind, at);
        self.apply_recorded(&mut history, user_id, kind, at, class_id, newly);
        alert
    }

    pub fn restriction_until(&self, user_id: &str, now: Ms) -> Option<Ms> {
        self.restrictions
            .get(user_id)
            .map(|e| *e.value())
            .filter(|until| now < *until)
    }

    /// Pure read: restricted iff `now < restriction_until`.
    pub fn is_restricted(&self, user_id: &str, now: Ms) -> bool {
        self.restriction_until(user_id, now).is_some()
    }

    pub async fn get_policy(&self, user_id: &str, now: Ms) -> PolicySnapshot {
        let window_start = now.saturating_sub(self.config.window_ms());
        let history = self.users.get(user_id).map(|e| e.value().clone());
        let (strike_count, restriction_until) = match history {
            Some(h) => {
                let h = h.lock().await;
                (h.count_between(window_start, now), h.active_restriction(now))
            }
            None => (0, None),
        };
        PolicySnapshot {
            user_id: user_id.to_string(),
            strike_count,
            threshold: self.config.strike_threshold,
            restricted: restriction_until.is_some(),
            restriction_until,
            window_start,
            window_end: now,
            restriction_duration_minutes: self.config.restriction_duration_minutes,
            remaining_ms: restriction_until.map_or(0, |until| until.saturating_sub(now)),
        }
    }

    pub(crate) fn user_histories(&self) -> Vec<(UserId, Arc<Mutex<StrikeHistory>>)> {
        self.users
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub(crate) fn history_handle(&self, user_id: &str) -> Arc<Mutex<StrikeHistory>> {
        self.users.entry(user_id.to_string()).or_default().value().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: Ms = DAY_MS;

    fn policy(threshold: u32) -> StrikePolicy {
        StrikePolicy::new(PolicyConfig {
            strike_threshold: threshold,
            rolling_window_days: 30,
            restriction_duration_minutes: 60,
            ..PolicyConfig::default()
        })
    }

    #[tokio::test]
    async fn third_absence_restricts() {
        let p = policy(3);
        let cid = Ulid::new();
        let a1 = p.record_event("u", StrikeKind::Absence, DAY, cid).await;
        let a2 = p.record_event("u", StrikeKind::Absence, 5 * DAY, cid).await;
        assert!(!a1.is_restricted && !a2.is_restricted);
        assert_eq!(a2.strikes, 2);

        let at = 10 * DAY;
        let a3 = p.record_event("u", StrikeKind::Absence, at, cid).await;
        assert_eq!(a3.strikes, 3);
        assert!(a3.is_restricted);
        assert_eq!(a3.restriction_until, Some(at + 60 * MINUTE_MS));
        assert!(p.is_restricted("u", at));
        assert!(p.is_restricted("u", at + 60 * MINUTE_MS - 1));
        assert!(!p.is_restricted("u", at + 60 * MINUTE_MS));
    }

    #[tokio::test]
    async fn old_events_fall_out_of_window() {
        let p = policy(2);
        let cid = Ulid::new();
        p.record_event("u", StrikeKind::LateCancellation, 0, cid).await;
        let alert = p.record_event("u", StrikeKind::Absence, 31 * DAY, cid).await;
        assert_eq!(alert.strikes, 1);
        assert!(!alert.is_restricted);
    }

    #[tokio::test]
    async fn active_restriction_is_not_extended() {
        let p = policy(1);
        let cid = Ulid::new();
        let first = p.record_event("u", StrikeKind::Absence, 1_000, cid).await;
        let until = first.restriction_until.unwrap();
        let second = p.record_event("u", StrikeKind::Absence, 2_000, cid).await;
        assert_eq!(second.restriction_until, Some(until));
        assert_eq!(second.strikes, 2);
    }

    #[tokio::test]
    async fn policy_snapshot_for_unknown_user() {
        let p = policy(3);
        let snap = p.get_policy("nobody", 50 * DAY).await;
        assert_eq!(snap.strike_count, 0);
        assert!(!snap.restricted);
        assert_eq!(snap.window_end - snap.window_start, 30 * DAY);
        assert_eq!(snap.remaining_ms, 0);
    }

    #[tokio::test]
    async fn snapshot_reports_remaining() {
        let p = policy(1);
        p.record_event("u", StrikeKind::Absence, 0, Ulid::new()).await;
        let snap = p.get_policy("u", 10 * MINUTE_MS).await;
        assert!(snap.restricted);
        assert_eq!(snap.strike_count, 1);
        assert_eq!(snap.remaining_ms, 50 * MINUTE_MS);
    }

    #[test]
    fn preview_event_does_not_mutate() {
        let p = policy(1);
        let h = StrikeHistory::default();
        let (alert, newly) = p.preview_event(&h, "u", StrikeKind::Absence, 100);
        assert!(alert.is_restricted);
        assert!(newly.is_some());
        assert!(h.events().is_empty());
        assert!(!p.is_restricted("u", 100));
    }

    #[test]
    fn out_of_order_events_stay_sorted() {
        let mut h = StrikeHistory::default();
        let cid = Ulid::new();
        h.push(StrikeEvent { kind: StrikeKind::Absence, at: 30, class_id: cid });
        h.push(StrikeEvent { kind: StrikeKind::Absence, at: 10, class_id: cid });
        h.push(StrikeEvent { kind: StrikeKind::Absence, at: 20, class_id: cid });
        let ats: Vec<_> = h.events().iter().map(|e| e.at).collect();
        assert_eq!(ats, [10, 20, 30]);
        assert_eq!(h.count_between(15, 30), 2);
        h.prune_before(20);
        assert_eq!(h.events().len(), 2);
    }
}
