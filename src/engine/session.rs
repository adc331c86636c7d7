use std::collections::HashMap;

use ulid::Ulid;

use crate::model::*;

use super::lifecycle::SessionWindow;
use super::ledger::Seats;
use super::waitlist::WaitlistQueue;

/// Everything the engine knows about one class session. Guarded by a single
/// per-session `RwLock`; that lock is the critical section for the seat
/// counter, the waitlist and every booking in the class.
#[derive(Debug, Clone)]
pub struct ClassState {
    pub id: Ulid,
    pub site_id: u32,
    pub name: Option<String>,
    pub starts_at: Ms,
    pub ends_at: Ms,
    pub seats: Seats,
    pub waitlist: WaitlistQueue,
    pub bookings: HashMap<Ulid, BookingRecord>,
    /// Every booking (tombstones included) a user has in this class.
    pub by_user: HashMap<UserId, Vec<Ulid>>,
    /// Set once the class is removed; lock holders must re-resolve.
    pub removed: bool,
}

impl ClassState {
    pub fn new(
        id: Ulid,
        site_id: u32,
        name: Option<String>,
        starts_at: Ms,
        ends_at: Ms,
        capacity: u32,
    ) -> Self {
        Self {
            id,
            site_id,
            name,
            starts_at,
            ends_at,
            seats: Seats::new(capacity),
            waitlist: WaitlistQueue::new(),
            bookings: HashMap::new(),
            by_user: HashMap::new(),
            removed: false,
        }
    }

    pub fn window(&self) -> SessionWindow {
        SessionWindow {
            starts_at: self.starts_at,
            ends_at: self.ends_at,
        }
    }

    pub fn has_started(&self, now: Ms) -> bool {
        now >= self.starts_at
    }

    pub fn insert_record(&mut self, record: BookingRecord) {
        self.by_user
            .entry(record.user_id.clone())
            .or_default()
            .push(record.id);
        self.bookings.insert(record.id, record);
    }

    pub fn records_for<'a>(&'a self, user_id: &str) -> impl Iterator<Item = &'a BookingRecord> {
        self.by_user
            .get(user_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.bookings.get(id))
    }

    /// The user's RESERVED or WAITLIST booking, if any.
    pub fn active_for(&self, user_id: &str) -> Option<&BookingRecord> {
        self.records_for(user_id).find(|r| r.status.is_active())
    }

    pub fn has_active_bookings(&self) -> bool {
        self.bookings.values().any(|r| r.status.is_active())
    }

    pub fn info(&self) -> ClassInfo {
        ClassInfo {
            id: self.id,
            site_id: self.site_id,
            name: self.name.clone(),
            starts_at: self.starts_at,
            ends_at: self.ends_at,
            capacity: self.seats.capacity(),
            enrolled: self.seats.enrolled(),
            waitlisted: self.waitlist.len(),
        }
    }

    pub fn view(&self, record: &BookingRecord) -> BookingView {
        let waitlist_position = if record.status == BookingStatus::Waitlist {
            self.waitlist.position_of(&record.user_id)
        } else {
            None
        };
        BookingView {
            booking: record.clone(),
            site_id: self.site_id,
            starts_at: self.starts_at,
            waitlist_position,
        }
    }

    /// Seat-holding bookings, recounted from scratch.
    pub fn count_seated(&self) -> u32 {
        self.bookings.values().filter(|r| r.status.holds_seat()).count() as u32
    }
}
