use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::OnceCell;

use crate::limits::*;
use crate::model::Ms;

use super::{Command, EngineError, Outcome};

struct Slot {
    created_at: Ms,
    request: Command,
    outcome: OnceCell<Outcome>,
}

/// Single-flight memo of successful outcomes by caller-supplied key.
///
/// Keys are namespaced by the command's scope (the user, or the booking for
/// attendance commands), so two callers never share a slot. The first request
/// under a key runs; concurrent duplicates wait on the same cell and every
/// later retry gets the stored outcome. Reusing a key for a different request
/// is `IdempotencyKeyReused`. Failures are not stored, so a request that
/// errored (nothing committed) can be retried.
pub(super) struct IdempotencyCache {
    slots: DashMap<(String, String), Arc<Slot>>,
    per_scope: DashMap<String, usize>,
}

impl IdempotencyCache {
    pub(super) fn new() -> Self {
        Self {
            slots: DashMap::new(),
            per_scope: DashMap::new(),
        }
    }

    pub(super) async fn run<F, Fut>(
        &self,
        key: &str,
        request: &Command,
        op: F,
    ) -> Result<Outcome, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Outcome, EngineError>>,
    {
        if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(EngineError::LimitExceeded("idempotency key length"));
        }
        let slot_key = (request.scope(), key.to_string());
        if !self.slots.contains_key(&slot_key) && self.slots.len() >= MAX_IDEMPOTENCY_KEYS {
            return Err(EngineError::LimitExceeded("too many pending idempotency keys"));
        }
        let slot = match self.slots.entry(slot_key) {
            Entry::Occupied(e) => e.get().clone(),
            Entry::Vacant(e) => {
                let mut used = self.per_scope.entry(e.key().0.clone()).or_insert(0);
                if *used >= MAX_IDEMPOTENCY_KEYS_PER_SCOPE {
                    return Err(EngineError::LimitExceeded("too many idempotency keys for one caller"));
                }
                *used += 1;
                drop(used);
                let slot = Arc::new(Slot {
                    created_at: request.now(),
                    request: request.clone(),
                    outcome: OnceCell::new(),
                });
                e.insert(slot.clone());
                slot
            }
        };

        if !slot.request.same_request(request) {
            return Err(EngineError::IdempotencyKeyReused(key.to_string()));
        }
        if let Some(done) = slot.outcome.get() {
            metrics::counter!(crate::observability::IDEMPOTENT_REPLAYS_TOTAL).increment(1);
            return Ok(done.clone());
        }
        slot.outcome.get_or_try_init(op).await.cloned()
    }

    /// Forget keys created before `cutoff`. Returns how many were dropped.
    pub(super) fn expire_before(&self, cutoff: Ms) -> usize {
        let before = self.slots.len();
        self.slots.retain(|(scope, _), slot| {
            let keep = slot.created_at >= cutoff;
            if !keep && let Some(mut used) = self.per_scope.get_mut(scope) {
                *used = used.saturating_sub(1);
            }
            keep
        });
        self.per_scope.retain(|_, used| *used > 0);
        before - self.slots.len()
    }

    #[cfg(test)]
    pub(super) fn len(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::model::{BookingRecord, BookingStatus, StatusReason};
    use ulid::Ulid;

    fn outcome() -> Outcome {
        Outcome::CheckedIn(BookingRecord::new(
            Ulid::new(),
            Ulid::new(),
            "u".into(),
            BookingStatus::Attended,
            StatusReason::CheckedIn,
            0,
        ))
    }

    fn enroll(user: &str, class_id: Ulid, now: Ms) -> Command {
        Command::Enroll { user_id: user.into(), class_id, now }
    }

    #[tokio::test]
    async fn runs_once_per_key() {
        let cache = IdempotencyCache::new();
        let calls = AtomicUsize::new(0);
        let expected = outcome();
        let cid = Ulid::new();
        for attempt in 0..3 {
            // Retries arrive later; the clock does not change the request.
            let got = cache
                .run("k1", &enroll("ana", cid, attempt * 1_000), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(expected.clone())
                })
                .await
                .unwrap();
            assert_eq!(got, expected);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn same_key_from_different_users_runs_both() {
        let cache = IdempotencyCache::new();
        let cid = Ulid::new();
        let calls = AtomicUsize::new(0);
        for user in ["ana", "bob"] {
            cache
                .run("k1", &enroll(user, cid, 0), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(outcome())
                })
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn key_reused_for_other_request_is_rejected() {
        let cache = IdempotencyCache::new();
        cache
            .run("k1", &enroll("ana", Ulid::new(), 0), || async { Ok(outcome()) })
            .await
            .unwrap();
        let err = cache
            .run("k1", &enroll("ana", Ulid::new(), 0), || async { Ok(outcome()) })
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::IdempotencyKeyReused("k1".into()));
        assert_eq!(err.status(), 422);
    }

    #[tokio::test]
    async fn one_caller_cannot_take_every_slot() {
        let cache = IdempotencyCache::new();
        let cid = Ulid::new();
        for i in 0..MAX_IDEMPOTENCY_KEYS_PER_SCOPE {
            cache
                .run(&format!("k{i}"), &enroll("ana", cid, 0), || async { Ok(outcome()) })
                .await
                .unwrap();
        }
        let err = cache
            .run("one-more", &enroll("ana", cid, 0), || async { Ok(outcome()) })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::LimitExceeded(_)));

        // Other callers are unaffected.
        cache
            .run("one-more", &enroll("bob", cid, 0), || async { Ok(outcome()) })
            .await
            .unwrap();

        // Expiry frees the quota again.
        assert_eq!(cache.expire_before(1), MAX_IDEMPOTENCY_KEYS_PER_SCOPE + 1);
        cache
            .run("one-more", &enroll("ana", cid, 5), || async { Ok(outcome()) })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn errors_are_not_memoized() {
        let cache = IdempotencyCache::new();
        let cmd = enroll("ana", Ulid::new(), 0);
        let first = cache
            .run("k", &cmd, || async { Err(EngineError::WalError("disk full".into())) })
            .await;
        assert!(first.is_err());
        let second = cache.run("k", &cmd, || async { Ok(outcome()) }).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn expiry_drops_old_keys() {
        let cache = IdempotencyCache::new();
        let cid = Ulid::new();
        cache.run("old", &enroll("ana", cid, 10), || async { Ok(outcome()) }).await.unwrap();
        cache.run("new", &enroll("ana", cid, 100), || async { Ok(outcome()) }).await.unwrap();
        assert_eq!(cache.expire_before(50), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn rejects_empty_key() {
        let cache = IdempotencyCache::new();
        let err = cache
            .run("", &enroll("ana", Ulid::new(), 0), || async { Ok(outcome()) })
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::LimitExceeded("idempotency key length"));
    }
}
