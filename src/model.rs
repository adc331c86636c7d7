use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

/// Opaque user identifier issued by the identity provider.
pub type UserId = String;

pub const MINUTE_MS: Ms = 60_000;
pub const DAY_MS: Ms = 86_400_000;

/// Wall-clock now.
pub fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Lifecycle status of a booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Reserved,
    Attended,
    Absent,
    Cancelled,
    Waitlist,
}

impl BookingStatus {
    /// RESERVED or WAITLIST: the booking can still change.
    pub fn is_active(self) -> bool {
        matches!(self, BookingStatus::Reserved | BookingStatus::Waitlist)
    }

    /// Bookings that occupy a seat in the capacity ledger.
    pub fn holds_seat(self) -> bool {
        matches!(
            self,
            BookingStatus::Reserved | BookingStatus::Attended | BookingStatus::Absent
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Reserved => "RESERVED",
            BookingStatus::Attended => "ATTENDED",
            BookingStatus::Absent => "ABSENT",
            BookingStatus::Cancelled => "CANCELLED",
            BookingStatus::Waitlist => "WAITLIST",
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a booking last changed status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusReason {
    Enrolled,
    Waitlisted,
    Promoted,
    Cancelled,
    LateCancellation,
    LeftWaitlist,
    CheckedIn,
    MarkedAttended,
    MarkedAbsent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingRecord {
    pub id: Ulid,
    pub class_id: Ulid,
    pub user_id: UserId,
    pub status: BookingStatus,
    pub created_at: Ms,
    pub status_changed_at: Ms,
    pub last_status_reason: StatusReason,
}

impl BookingRecord {
    pub fn new(
        id: Ulid,
        class_id: Ulid,
        user_id: UserId,
        status: BookingStatus,
        reason: StatusReason,
        at: Ms,
    ) -> Self {
        Self {
            id,
            class_id,
            user_id,
            status,
            created_at: at,
            status_changed_at: at,
            last_status_reason: reason,
        }
    }
}

/// Qualifying negative events counted by the strike policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrikeKind {
    LateCancellation,
    Absence,
}

impl StrikeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StrikeKind::LateCancellation => "LATE_CANCELLATION",
            StrikeKind::Absence => "ABSENCE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrikeEvent {
    pub kind: StrikeKind,
    pub at: Ms,
    pub class_id: Ulid,
}

/// The event types, flat with no nesting. A WAL frame carries one commit: a
/// `Vec<Event>` that is applied all-or-nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ClassScheduled {
        id: Ulid,
        site_id: u32,
        name: Option<String>,
        starts_at: Ms,
        ends_at: Ms,
        capacity: u32,
    },
    CapacityChanged {
        id: Ulid,
        capacity: u32,
    },
    ClassRemoved {
        id: Ulid,
    },
    BookingReserved {
        id: Ulid,
        class_id: Ulid,
        user_id: UserId,
        at: Ms,
    },
    WaitlistJoined {
        id: Ulid,
        class_id: Ulid,
        user_id: UserId,
        at: Ms,
        joined_at: u64,
    },
    WaitlistPromoted {
        id: Ulid,
        class_id: Ulid,
        at: Ms,
    },
    BookingCancelled {
        id: Ulid,
        class_id: Ulid,
        at: Ms,
        reason: StatusReason,
    },
    AttendanceMarked {
        id: Ulid,
        class_id: Ulid,
        status: BookingStatus,
        at: Ms,
        reason: StatusReason,
    },
    StrikeRecorded {
        user_id: UserId,
        kind: StrikeKind,
        at: Ms,
        class_id: Ulid,
        restriction_until: Option<Ms>,
    },
    /// Compaction output: a booking as it currently stands.
    BookingRestored {
        record: BookingRecord,
        joined_at: Option<u64>,
    },
    /// Compaction output: a user's strike history inside the rolling window.
    StrikesRestored {
        user_id: UserId,
        events: Vec<StrikeEvent>,
        restriction_until: Option<Ms>,
    },
}

impl Event {
    /// The class an event mutates, for events applied under a class lock.
    pub fn class_id(&self) -> Option<Ulid> {
        match self {
            Event::CapacityChanged { id, .. } | Event::ClassRemoved { id } => Some(*id),
            Event::BookingReserved { class_id, .. }
            | Event::WaitlistJoined { class_id, .. }
            | Event::WaitlistPromoted { class_id, .. }
            | Event::BookingCancelled { class_id, .. }
            | Event::AttendanceMarked { class_id, .. } => Some(*class_id),
            Event::BookingRestored { record, .. } => Some(record.class_id),
            Event::ClassScheduled { .. }
            | Event::StrikeRecorded { .. }
            | Event::StrikesRestored { .. } => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassInfo {
    pub id: Ulid,
    pub site_id: u32,
    pub name: Option<String>,
    pub starts_at: Ms,
    pub ends_at: Ms,
    pub capacity: u32,
    pub enrolled: u32,
    pub waitlisted: usize,
}

/// A booking plus its live waitlist rank, for "my bookings" style listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingView {
    pub booking: BookingRecord,
    pub site_id: u32,
    pub starts_at: Ms,
    pub waitlist_position: Option<usize>,
}

/// Surfaced to callers after a seat was handed to a waitlisted user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitlistPromotionInfo {
    pub promoted: bool,
    pub class_id: Ulid,
    pub promoted_user_id: UserId,
    pub booking_id: Ulid,
}

/// Payload describing a freshly recorded strike.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrikeAlert {
    #[serde(rename = "type")]
    pub kind: StrikeKind,
    pub user_id: UserId,
    pub strikes: u32,
    pub threshold: u32,
    pub is_restricted: bool,
    pub restriction_until: Option<Ms>,
}

/// Read-only view of a user's strike window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySnapshot {
    pub user_id: UserId,
    pub strike_count: u32,
    pub threshold: u32,
    pub restricted: bool,
    pub restriction_until: Option<Ms>,
    pub window_start: Ms,
    pub window_end: Ms,
    pub restriction_duration_minutes: u32,
    pub remaining_ms: Ms,
}
