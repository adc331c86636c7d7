//! Booking state machine.
//!
//! ```text
//!   (none) ──admit──▶ RESERVED ──check-in / mark──▶ ATTENDED
//!   (none) ──queue──▶ WAITLIST        │ ──mark absent──▶ ABSENT
//!      WAITLIST ──promote──▶ RESERVED │ ──cancel──▶ CANCELLED
//!      WAITLIST ──leave──▶ CANCELLED
//! ```
//!
//! Everything not drawn above is an `InvalidStatusTransition`.

use crate::model::{BookingRecord, BookingStatus, Ms, StatusReason};

use super::EngineError;

/// What is being asked of a booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    CheckIn,
    MarkAttended,
    MarkAbsent,
    Cancel,
    Promote,
    LeaveWaitlist,
}

impl Transition {
    pub fn target(self) -> BookingStatus {
        match self {
            Transition::CheckIn | Transition::MarkAttended => BookingStatus::Attended,
            Transition::MarkAbsent => BookingStatus::Absent,
            Transition::Cancel | Transition::LeaveWaitlist => BookingStatus::Cancelled,
            Transition::Promote => BookingStatus::Reserved,
        }
    }

    fn source(self) -> BookingStatus {
        match self {
            Transition::Promote | Transition::LeaveWaitlist => BookingStatus::Waitlist,
            _ => BookingStatus::Reserved,
        }
    }

    pub fn reason(self) -> StatusReason {
        match self {
            Transition::CheckIn => StatusReason::CheckedIn,
            Transition::MarkAttended => StatusReason::MarkedAttended,
            Transition::MarkAbsent => StatusReason::MarkedAbsent,
            Transition::Cancel => StatusReason::Cancelled,
            Transition::Promote => StatusReason::Promoted,
            Transition::LeaveWaitlist => StatusReason::LeftWaitlist,
        }
    }
}

/// The session timing a transition is validated against.
#[derive(Debug, Clone, Copy)]
pub struct SessionWindow {
    pub starts_at: Ms,
    pub ends_at: Ms,
}

/// Validate `transition` from `from` at `now`, returning the new status.
pub fn check_transition(
    from: BookingStatus,
    transition: Transition,
    window: SessionWindow,
    now: Ms,
) -> Result<BookingStatus, EngineError> {
    let to = transition.target();
    let invalid = || EngineError::InvalidStatusTransition { from, to };

    if from != transition.source() {
        return Err(invalid());
    }
    let in_time = match transition {
        // attendance only counts before or during the session
        Transition::CheckIn | Transition::MarkAttended => now < window.ends_at,
        Transition::MarkAbsent => now >= window.starts_at,
        // a finished session's reservation gets marked, not cancelled
        Transition::Cancel => now < window.ends_at,
        Transition::Promote => now < window.starts_at,
        Transition::LeaveWaitlist => true,
    };
    if !in_time {
        return Err(invalid());
    }
    Ok(to)
}

impl BookingRecord {
    pub fn set_status(&mut self, status: BookingStatus, reason: StatusReason, at: Ms) {
        self.status = status;
        self.last_status_reason = reason;
        self.status_changed_at = at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: SessionWindow = SessionWindow { starts_at: 1_000, ends_at: 2_000 };

    #[test]
    fn reserved_paths() {
        let r = BookingStatus::Reserved;
        assert_eq!(
            check_transition(r, Transition::CheckIn, WINDOW, 900),
            Ok(BookingStatus::Attended)
        );
        assert_eq!(
            check_transition(r, Transition::MarkAttended, WINDOW, 1_500),
            Ok(BookingStatus::Attended)
        );
        assert_eq!(
            check_transition(r, Transition::MarkAbsent, WINDOW, 1_000),
            Ok(BookingStatus::Absent)
        );
        assert_eq!(
            check_transition(r, Transition::Cancel, WINDOW, 10),
            Ok(BookingStatus::Cancelled)
        );
    }

    #[test]
    fn timing_guards() {
        let r = BookingStatus::Reserved;
        assert!(check_transition(r, Transition::CheckIn, WINDOW, 2_000).is_err());
        assert!(check_transition(r, Transition::MarkAbsent, WINDOW, 999).is_err());
        assert!(check_transition(r, Transition::Cancel, WINDOW, 2_000).is_err());
        assert!(
            check_transition(BookingStatus::Waitlist, Transition::Promote, WINDOW, 1_000).is_err()
        );
    }

    #[test]
    fn terminal_states_reject_everything() {
        for from in [BookingStatus::Attended, BookingStatus::Absent, BookingStatus::Cancelled] {
            for t in [
                Transition::CheckIn,
                Transition::MarkAttended,
                Transition::MarkAbsent,
                Transition::Cancel,
                Transition::Promote,
                Transition::LeaveWaitlist,
            ] {
                let err = check_transition(from, t, WINDOW, 1_500).unwrap_err();
                assert_eq!(err, EngineError::InvalidStatusTransition { from, to: t.target() });
            }
        }
    }

    #[test]
    fn waitlist_cannot_attend() {
        let err =
            check_transition(BookingStatus::Waitlist, Transition::MarkAttended, WINDOW, 1_500)
                .unwrap_err();
        assert_eq!(
            err,
            EngineError::InvalidStatusTransition {
                from: BookingStatus::Waitlist,
                to: BookingStatus::Attended,
            }
        );
        assert_eq!(
            check_transition(BookingStatus::Waitlist, Transition::LeaveWaitlist, WINDOW, 5_000),
            Ok(BookingStatus::Cancelled)
        );
    }

    #[test]
    fn set_status_stamps_change() {
        let mut rec = BookingRecord::new(
            ulid::Ulid::new(),
            ulid::Ulid::new(),
            "u".into(),
            BookingStatus::Reserved,
            StatusReason::Enrolled,
            5,
        );
        rec.set_status(BookingStatus::Attended, StatusReason::CheckedIn, 9);
        assert_eq!(rec.created_at, 5);
        assert_eq!(rec.status_changed_at, 9);
        assert_eq!(rec.last_status_reason, StatusReason::CheckedIn);
    }
}
