use serde::Serialize;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

/// A booking mutation as issued by a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Enroll { user_id: UserId, class_id: Ulid, now: Ms },
    Cancel { user_id: UserId, class_id: Ulid, now: Ms },
    LeaveWaitlist { user_id: UserId, class_id: Ulid, now: Ms },
    CheckIn { booking_id: Ulid, now: Ms },
    MarkAttendance { booking_id: Ulid, status: BookingStatus, now: Ms },
}

impl Command {
    pub fn now(&self) -> Ms {
        match self {
            Command::Enroll { now, .. }
            | Command::Cancel { now, .. }
            | Command::LeaveWaitlist { now, .. }
            | Command::CheckIn { now, .. }
            | Command::MarkAttendance { now, .. } => *now,
        }
    }

    /// The caller a command acts for. Idempotency keys live in this namespace.
    pub fn scope(&self) -> String {
        match self {
            Command::Enroll { user_id, .. }
            | Command::Cancel { user_id, .. }
            | Command::LeaveWaitlist { user_id, .. } => format!("user:{user_id}"),
            Command::CheckIn { booking_id, .. } | Command::MarkAttendance { booking_id, .. } => {
                format!("booking:{booking_id}")
            }
        }
    }

    /// Same operation on the same subject. A retry carries a later `now`,
    /// so the clock is ignored.
    pub fn same_request(&self, other: &Command) -> bool {
        self.clone().at(0) == other.clone().at(0)
    }

    fn at(mut self, t: Ms) -> Self {
        match &mut self {
            Command::Enroll { now, .. }
            | Command::Cancel { now, .. }
            | Command::LeaveWaitlist { now, .. }
            | Command::CheckIn { now, .. }
            | Command::MarkAttendance { now, .. } => *now = t,
        }
        self
    }

    pub fn label(&self) -> &'static str {
        match self {
            Command::Enroll { .. } => "enroll",
            Command::Cancel { .. } => "cancel",
            Command::LeaveWaitlist { .. } => "leave_waitlist",
            Command::CheckIn { .. } => "check_in",
            Command::MarkAttendance { .. } => "mark_attendance",
        }
    }
}

/// Result of `enroll`: a seat, or a place in line. Overflow is not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum EnrollOutcome {
    Reserved {
        booking: BookingRecord,
    },
    Waitlisted {
        booking: BookingRecord,
        waitlisted: bool,
        position: usize,
    },
}

impl EnrollOutcome {
    pub fn booking(&self) -> &BookingRecord {
        match self {
            EnrollOutcome::Reserved { booking } | EnrollOutcome::Waitlisted { booking, .. } => {
                booking
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelOutcome {
    pub booking: BookingRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waitlist_promotion: Option<WaitlistPromotionInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strike_alert: Option<StrikeAlert>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceOutcome {
    pub booking: BookingRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strike_alert: Option<StrikeAlert>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Enrolled(EnrollOutcome),
    Cancelled(CancelOutcome),
    LeftWaitlist(BookingRecord),
    CheckedIn(BookingRecord),
    AttendanceMarked(AttendanceOutcome),
}

impl Engine {
    /// Run a command, at most once per idempotency key.
    pub async fn execute(
        &self,
        command: Command,
        idempotency_key: Option<&str>,
    ) -> Result<Outcome, EngineError> {
        let label = command.label();
        let start = std::time::Instant::now();
        let result = match idempotency_key {
            Some(key) => {
                let request = command.clone();
                self.idempotency
                    .run(key, &request, || self.dispatch(command))
                    .await
            }
            None => self.dispatch(command).await,
        };
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(crate::observability::COMMANDS_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(crate::observability::COMMAND_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn dispatch(&self, command: Command) -> Result<Outcome, EngineError> {
        match command {
            Command::Enroll { user_id, class_id, now } => {
                self.enroll(&user_id, class_id, now).await.map(Outcome::Enrolled)
            }
            Command::Cancel { user_id, class_id, now } => {
                self.cancel(&user_id, class_id, now).await.map(Outcome::Cancelled)
            }
            Command::LeaveWaitlist { user_id, class_id, now } => self
                .leave_waitlist(&user_id, class_id, now)
                .await
                .map(Outcome::LeftWaitlist),
            Command::CheckIn { booking_id, now } => {
                self.check_in(booking_id, now).await.map(Outcome::CheckedIn)
            }
            Command::MarkAttendance { booking_id, status, now } => self
                .mark_attendance(booking_id, status, now)
                .await
                .map(Outcome::AttendanceMarked),
        }
    }

    /// Drop idempotency keys older than `cutoff`.
    pub fn expire_idempotency_keys(&self, cutoff: Ms) -> usize {
        self.idempotency.expire_before(cutoff)
    }
}
