use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use ulid::Ulid;

use crate::model::UserId;

use super::EngineError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitlistEntry {
    pub user_id: UserId,
    pub booking_id: Ulid,
    /// Engine-wide logical clock tick, not wall time.
    pub joined_at: u64,
}

/// Ordering key: logical join time, then insertion order within this queue.
type QueueKey = (u64, u64);

/// FIFO of users waiting for a seat in one session.
#[derive(Debug, Clone, Default)]
pub struct WaitlistQueue {
    order: BTreeMap<QueueKey, WaitlistEntry>,
    index: HashMap<UserId, QueueKey>,
    next_seq: u64,
}

impl WaitlistQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn enqueue(
        &mut self,
        class_id: Ulid,
        user_id: UserId,
        booking_id: Ulid,
        joined_at: u64,
    ) -> Result<(), EngineError> {
        if self.index.contains_key(&user_id) {
            return Err(EngineError::AlreadyWaitlisted(class_id));
        }
        let key = (joined_at, self.next_seq);
        self.next_seq += 1;
        self.index.insert(user_id.clone(), key);
        self.order.insert(key, WaitlistEntry { user_id, booking_id, joined_at });
        Ok(())
    }

    /// The entry that would be promoted next.
    pub fn peek_next(&self) -> Option<&WaitlistEntry> {
        self.order.values().next()
    }

    pub fn dequeue_next(&mut self) -> Option<WaitlistEntry> {
        let (_, entry) = self.order.pop_first()?;
        self.index.remove(&entry.user_id);
        Some(entry)
    }

    /// Remove a user's entry; absent users are a no-op.
    pub fn remove(&mut self, user_id: &str) -> Option<WaitlistEntry> {
        let key = self.index.remove(user_id)?;
        self.order.remove(&key)
    }

    /// 1-based rank among active entries.
    pub fn position_of(&self, user_id: &str) -> Option<usize> {
        let key = self.index.get(user_id)?;
        Some(self.order.range(..*key).count() + 1)
    }

    pub fn joined_at_of(&self, user_id: &str) -> Option<u64> {
        self.index.get(user_id).map(|(joined_at, _)| *joined_at)
    }

    pub fn iter(&self) -> impl Iterator<Item = &WaitlistEntry> {
        self.order.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_with(users: &[(&str, u64)]) -> WaitlistQueue {
        let mut q = WaitlistQueue::new();
        for (u, t) in users {
            q.enqueue(Ulid::nil(), (*u).to_string(), Ulid::new(), *t).unwrap();
        }
        q
    }

    #[test]
    fn dequeues_in_join_order() {
        let mut q = queue_with(&[("b", 20), ("a", 10), ("c", 30)]);
        assert_eq!(q.peek_next().unwrap().user_id, "a");
        let order: Vec<_> = std::iter::from_fn(|| q.dequeue_next())
            .map(|e| e.user_id)
            .collect();
        assert_eq!(order, ["a", "b", "c"]);
        assert!(q.is_empty());
        assert!(q.dequeue_next().is_none());
    }

    #[test]
    fn duplicate_rejected() {
        let class_id = Ulid::new();
        let mut q = WaitlistQueue::new();
        q.enqueue(class_id, "a".into(), Ulid::new(), 1).unwrap();
        let err = q.enqueue(class_id, "a".into(), Ulid::new(), 2).unwrap_err();
        assert_eq!(err, EngineError::AlreadyWaitlisted(class_id));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn ties_break_by_insertion() {
        let mut q = queue_with(&[("first", 5), ("second", 5)]);
        assert_eq!(q.position_of("first"), Some(1));
        assert_eq!(q.position_of("second"), Some(2));
        assert_eq!(q.dequeue_next().unwrap().user_id, "first");
    }

    #[test]
    fn positions_shift_after_remove() {
        let mut q = queue_with(&[("a", 1), ("b", 2), ("c", 3)]);
        assert_eq!(q.position_of("c"), Some(3));
        assert!(q.remove("b").is_some());
        assert_eq!(q.position_of("c"), Some(2));
        assert_eq!(q.position_of("b"), None);
        // idempotent
        assert!(q.remove("b").is_none());
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn rejoin_after_leaving_goes_to_back() {
        let mut q = queue_with(&[("a", 1), ("b", 2)]);
        q.remove("a");
        q.enqueue(Ulid::nil(), "a".into(), Ulid::new(), 3).unwrap();
        assert_eq!(q.position_of("a"), Some(2));
        assert_eq!(q.joined_at_of("a"), Some(3));
    }
}
