use ulid::Ulid;

use crate::model::{BookingStatus, Ms};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    ClassNotFound(Ulid),
    BookingNotFound(Ulid),
    AlreadyExists(Ulid),
    AlreadyEnrolled(Ulid),
    AlreadyWaitlisted(Ulid),
    /// A cancelled booking for this class blocks a second attempt.
    AlreadyCancelledOnce(Ulid),
    NotEnrolled(Ulid),
    RestrictedUser {
        until: Ms,
    },
    /// Seats and waitlist are both full.
    CapacityFull(Ulid),
    InvalidStatusTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    ClassClosed(Ulid),
    ClassInUse(Ulid),
    CapacityBelowEnrolled {
        capacity: u32,
        enrolled: u32,
    },
    /// The class was replaced while we waited for its lock.
    StaleWrite(Ulid),
    /// The key already names a different request from the same caller.
    IdempotencyKeyReused(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Stable machine-readable code surfaced to callers.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::ClassNotFound(_) => "CLASS_NOT_FOUND",
            EngineError::BookingNotFound(_) => "BOOKING_NOT_FOUND",
            EngineError::AlreadyExists(_) => "ALREADY_EXISTS",
            EngineError::AlreadyEnrolled(_) => "ALREADY_ENROLLED",
            EngineError::AlreadyWaitlisted(_) => "ALREADY_WAITLISTED",
            EngineError::AlreadyCancelledOnce(_) => "ALREADY_CANCELLED_ONCE",
            EngineError::NotEnrolled(_) => "NOT_ENROLLED",
            EngineError::RestrictedUser { .. } => "RESTRICTED",
            EngineError::CapacityFull(_) => "CAPACITY_FULL",
            EngineError::InvalidStatusTransition { .. } => "INVALID_STATUS_TRANSITION",
            EngineError::ClassClosed(_) => "CLASS_CLOSED",
            EngineError::ClassInUse(_) => "CLASS_IN_USE",
            EngineError::CapacityBelowEnrolled { .. } => "CAPACITY_BELOW_ENROLLED",
            EngineError::StaleWrite(_) => "STALE_WRITE",
            EngineError::IdempotencyKeyReused(_) => "IDEMPOTENCY_KEY_REUSED",
            EngineError::LimitExceeded(_) => "LIMIT_EXCEEDED",
            EngineError::WalError(_) => "STORAGE_ERROR",
        }
    }

    /// HTTP-equivalent status for the excluded HTTP gateway.
    pub fn status(&self) -> u16 {
        match self {
            EngineError::ClassNotFound(_)
            | EngineError::BookingNotFound(_)
            | EngineError::NotEnrolled(_) => 404,
            EngineError::RestrictedUser { .. } => 403,
            EngineError::LimitExceeded(_) | EngineError::IdempotencyKeyReused(_) => 422,
            EngineError::WalError(_) => 503,
            _ => 409,
        }
    }

    /// Worth retrying unchanged: nothing was committed.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::StaleWrite(_) | EngineError::WalError(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::ClassNotFound(id) => write!(f, "class not found: {id}"),
            EngineError::BookingNotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::AlreadyEnrolled(id) => write!(f, "already enrolled in class {id}"),
            EngineError::AlreadyWaitlisted(id) => {
                write!(f, "already on the waitlist for class {id}")
            }
            EngineError::AlreadyCancelledOnce(id) => {
                write!(f, "a cancelled booking for class {id} prevents re-enrolling")
            }
            EngineError::NotEnrolled(id) => write!(f, "no active booking in class {id}"),
            EngineError::RestrictedUser { until } => {
                write!(f, "booking restricted until {until} after repeated strikes")
            }
            EngineError::CapacityFull(id) => {
                write!(f, "class {id} is full and its waitlist is closed")
            }
            EngineError::InvalidStatusTransition { from, to } => {
                write!(f, "invalid status transition {from} -> {to}")
            }
            EngineError::ClassClosed(id) => write!(f, "class {id} has already started"),
            EngineError::ClassInUse(id) => {
                write!(f, "cannot remove class {id}: it still has active bookings")
            }
            EngineError::CapacityBelowEnrolled { capacity, enrolled } => {
                write!(f, "capacity {capacity} is below the {enrolled} seats already taken")
            }
            EngineError::StaleWrite(id) => {
                write!(f, "class {id} changed concurrently, retry the request")
            }
            EngineError::IdempotencyKeyReused(key) => {
                write!(f, "idempotency key {key:?} was already used for a different request")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restricted_maps_to_forbidden() {
        let e = EngineError::RestrictedUser { until: 42 };
        assert_eq!(e.code(), "RESTRICTED");
        assert_eq!(e.status(), 403);
        assert!(e.to_string().contains("42"));
    }

    #[test]
    fn transition_message_names_both_states() {
        let e = EngineError::InvalidStatusTransition {
            from: BookingStatus::Attended,
            to: BookingStatus::Absent,
        };
        assert_eq!(e.to_string(), "invalid status transition ATTENDED -> ABSENT");
        assert_eq!(e.status(), 409);
    }

    #[test]
    fn only_storage_and_stale_are_transient() {
        assert!(EngineError::StaleWrite(Ulid::new()).is_transient());
        assert!(EngineError::WalError("disk".into()).is_transient());
        assert!(!EngineError::AlreadyEnrolled(Ulid::new()).is_transient());
    }
}
