use std::sync::Arc;

use chrono::DateTime;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::engine::{Command, Engine, EngineError, Outcome};
use crate::limits::MAX_LINE_LEN;
use crate::model::*;

/// One request line: `{"op": "...", "idempotencyKey": "...", ...}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(flatten)]
    pub request: Request,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Request {
    ScheduleClass {
        #[serde(default)]
        class_id: Option<Ulid>,
        site_id: u32,
        #[serde(default)]
        name: Option<String>,
        starts_at: Ms,
        duration_minutes: i64,
        capacity: u32,
    },
    UpdateCapacity { class_id: Ulid, capacity: u32 },
    RemoveClass { class_id: Ulid },
    Enroll { user_id: UserId, class_id: Ulid },
    Cancel { user_id: UserId, class_id: Ulid },
    LeaveWaitlist { user_id: UserId, class_id: Ulid },
    CheckIn { booking_id: Ulid },
    MarkAttendance { booking_id: Ulid, status: BookingStatus },
    ListClasses {
        #[serde(default)]
        site_id: Option<u32>,
    },
    GetClass { class_id: Ulid },
    GetBooking { booking_id: Ulid },
    MyBookings {
        user_id: UserId,
        #[serde(default)]
        site_id: Option<u32>,
    },
    MyWaitlists {
        user_id: UserId,
        #[serde(default)]
        site_id: Option<u32>,
    },
    ClassBookings {
        class_id: Ulid,
        #[serde(default)]
        status: Option<BookingStatus>,
    },
    WaitlistPosition { user_id: UserId, class_id: Ulid },
    Policy { user_id: UserId },
}

impl Request {
    pub fn label(&self) -> &'static str {
        match self {
            Request::ScheduleClass { .. } => "schedule_class",
            Request::UpdateCapacity { .. } => "update_capacity",
            Request::RemoveClass { .. } => "remove_class",
            Request::Enroll { .. } => "enroll",
            Request::Cancel { .. } => "cancel",
            Request::LeaveWaitlist { .. } => "leave_waitlist",
            Request::CheckIn { .. } => "check_in",
            Request::MarkAttendance { .. } => "mark_attendance",
            Request::ListClasses { .. } => "list_classes",
            Request::GetClass { .. } => "get_class",
            Request::GetBooking { .. } => "get_booking",
            Request::MyBookings { .. } => "my_bookings",
            Request::MyWaitlists { .. } => "my_waitlists",
            Request::ClassBookings { .. } => "class_bookings",
            Request::WaitlistPosition { .. } => "waitlist_position",
            Request::Policy { .. } => "policy",
        }
    }

    /// Booking mutations go through `Engine::execute` for idempotency.
    fn into_command(self, now: Ms) -> Result<Command, Request> {
        Ok(match self {
            Request::Enroll { user_id, class_id } => Command::Enroll { user_id, class_id, now },
            Request::Cancel { user_id, class_id } => Command::Cancel { user_id, class_id, now },
            Request::LeaveWaitlist { user_id, class_id } => {
                Command::LeaveWaitlist { user_id, class_id, now }
            }
            Request::CheckIn { booking_id } => Command::CheckIn { booking_id, now },
            Request::MarkAttendance { booking_id, status } => {
                Command::MarkAttendance { booking_id, status, now }
            }
            other => return Err(other),
        })
    }
}

// ── Response shapes ──────────────────────────────────────

/// Class listing row with the session start rendered for display (UTC).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassListing {
    pub id: Ulid,
    pub site_id: u32,
    pub name: Option<String>,
    pub capacity: u32,
    pub enrolled: u32,
    pub waitlisted: usize,
    pub date: String,
    pub time: String,
    pub starts_at: Ms,
    pub ends_at: Ms,
}

impl From<ClassInfo> for ClassListing {
    fn from(info: ClassInfo) -> Self {
        let (date, time) = match DateTime::from_timestamp_millis(info.starts_at) {
            Some(dt) => (dt.format("%Y-%m-%d").to_string(), dt.format("%H:%M").to_string()),
            None => (String::new(), String::new()),
        };
        Self {
            id: info.id,
            site_id: info.site_id,
            name: info.name,
            capacity: info.capacity,
            enrolled: info.enrolled,
            waitlisted: info.waitlisted,
            date,
            time,
            starts_at: info.starts_at,
            ends_at: info.ends_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentWindow {
    pub no_shows: u32,
    pub threshold: u32,
    pub restricted: bool,
    pub restriction_until: Option<Ms>,
    pub minutes: u32,
    pub window_start: Ms,
    pub window_end: Ms,
}

impl From<PolicySnapshot> for CurrentWindow {
    fn from(p: PolicySnapshot) -> Self {
        Self {
            no_shows: p.strike_count,
            threshold: p.threshold,
            restricted: p.restricted,
            restriction_until: p.restriction_until,
            minutes: p.restriction_duration_minutes,
            window_start: p.window_start,
            window_end: p.window_end,
        }
    }
}

fn error_body(code: &str, message: String, status: u16, restriction_until: Option<Ms>) -> Value {
    let mut error = json!({ "code": code, "message": message, "status": status });
    if let Some(until) = restriction_until {
        error["restrictionUntil"] = json!(until);
    }
    json!({ "error": error })
}

pub fn engine_error_json(e: &EngineError) -> Value {
    let until = match e {
        EngineError::RestrictedUser { until } => Some(*until),
        _ => None,
    };
    error_body(e.code(), e.to_string(), e.status(), until)
}

fn bad_request(message: String) -> Value {
    error_body("BAD_REQUEST", message, 400, None)
}

fn to_json<T: Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|e| error_body("INTERNAL", e.to_string(), 500, None))
}

fn outcome_json(outcome: Outcome) -> Value {
    match outcome {
        Outcome::Enrolled(o) => to_json(o),
        Outcome::Cancelled(o) => to_json(o),
        Outcome::LeftWaitlist(booking) | Outcome::CheckedIn(booking) => {
            json!({ "booking": to_json(booking) })
        }
        Outcome::AttendanceMarked(o) => to_json(o),
    }
}

/// Handle one parsed request against the engine at wall-clock `now`.
pub async fn handle_request(
    engine: &Engine,
    envelope: Envelope,
    now: Ms,
) -> Result<Value, EngineError> {
    let key = envelope.idempotency_key;
    let request = match envelope.request.into_command(now) {
        Ok(command) => {
            return engine.execute(command, key.as_deref()).await.map(outcome_json);
        }
        Err(request) => request,
    };
    match request {
        Request::ScheduleClass { class_id, site_id, name, starts_at, duration_minutes, capacity } => {
            let id = class_id.unwrap_or_else(Ulid::new);
            engine
                .schedule_class(id, site_id, name, starts_at, duration_minutes.saturating_mul(MINUTE_MS), capacity)
                .await?;
            let info = engine.class_info(id).await?;
            Ok(to_json(ClassListing::from(info)))
        }
        Request::UpdateCapacity { class_id, capacity } => {
            let promotions = engine.update_capacity(class_id, capacity, now).await?;
            let info = engine.class_info(class_id).await?;
            Ok(json!({ "class": to_json(ClassListing::from(info)), "promotions": to_json(promotions) }))
        }
        Request::RemoveClass { class_id } => {
            engine.remove_class(class_id).await?;
            Ok(json!({ "removed": true, "classId": class_id }))
        }
        Request::ListClasses { site_id } => {
            let rows: Vec<ClassListing> = engine
                .list_classes(site_id)
                .await
                .into_iter()
                .map(ClassListing::from)
                .collect();
            Ok(to_json(rows))
        }
        Request::GetClass { class_id } => {
            let info = engine.class_info(class_id).await?;
            Ok(to_json(ClassListing::from(info)))
        }
        Request::GetBooking { booking_id } => Ok(to_json(engine.get_booking(booking_id).await?)),
        Request::MyBookings { user_id, site_id } => {
            Ok(to_json(engine.user_bookings(&user_id, site_id).await))
        }
        Request::MyWaitlists { user_id, site_id } => {
            Ok(to_json(engine.user_waitlists(&user_id, site_id).await))
        }
        Request::ClassBookings { class_id, status } => {
            Ok(to_json(engine.class_bookings(class_id, status).await?))
        }
        Request::WaitlistPosition { user_id, class_id } => {
            let position = engine.waitlist_position(&user_id, class_id).await?;
            Ok(json!({ "position": position }))
        }
        Request::Policy { user_id } => {
            let snapshot = engine.get_policy(&user_id, now).await;
            Ok(json!({ "currentWindow": to_json(CurrentWindow::from(snapshot)) }))
        }
        Request::Enroll { .. }
        | Request::Cancel { .. }
        | Request::LeaveWaitlist { .. }
        | Request::CheckIn { .. }
        | Request::MarkAttendance { .. } => unreachable!("booking commands dispatched above"),
    }
}

/// Parse and answer one line. Never fails: every problem becomes an error body.
pub async fn handle_line(engine: &Engine, line: &str) -> Value {
    let envelope: Envelope = match serde_json::from_str(line) {
        Ok(env) => env,
        Err(e) => {
            metrics::counter!(crate::observability::REQUESTS_TOTAL, "op" => "invalid", "status" => "error")
                .increment(1);
            return bad_request(e.to_string());
        }
    };
    let label = envelope.request.label();
    let start = std::time::Instant::now();
    let result = handle_request(engine, envelope, now_ms()).await;
    let status = if result.is_ok() { "ok" } else { "error" };
    metrics::counter!(crate::observability::REQUESTS_TOTAL, "op" => label, "status" => status)
        .increment(1);
    metrics::histogram!(crate::observability::REQUEST_DURATION_SECONDS, "op" => label)
        .record(start.elapsed().as_secs_f64());
    match result {
        Ok(value) => value,
        Err(e) if e.is_transient() => {
            warn!("{label} failed transiently: {e}");
            engine_error_json(&e)
        }
        Err(e) => {
            debug!("{label} failed: {e}");
            engine_error_json(&e)
        }
    }
}

/// Serve one client: one JSON request per line in, one JSON response per line out.
pub async fn process_connection<S>(socket: S, engine: Arc<Engine>) -> Result<(), LinesCodecError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    while let Some(line) = framed.next().await {
        let line = match line {
            Ok(line) => line,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                warn!("request line over {MAX_LINE_LEN} bytes, closing connection");
                let body = bad_request(format!("request line exceeds {MAX_LINE_LEN} bytes"));
                framed.send(body.to_string()).await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if line.trim().is_empty() {
            continue;
        }
        let response = handle_line(&engine, &line).await;
        framed.send(response.to_string()).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_enroll_with_key() {
        let cid = Ulid::new();
        let line = format!(r#"{{"op":"enroll","userId":"ana","classId":"{cid}","idempotencyKey":"k"}}"#);
        let env: Envelope = serde_json::from_str(&line).unwrap();
        assert_eq!(env.idempotency_key.as_deref(), Some("k"));
        assert_eq!(env.request, Request::Enroll { user_id: "ana".into(), class_id: cid });
    }

    #[test]
    fn parses_attendance_status() {
        let bid = Ulid::new();
        let line = format!(r#"{{"op":"markAttendance","bookingId":"{bid}","status":"ABSENT"}}"#);
        let env: Envelope = serde_json::from_str(&line).unwrap();
        assert_eq!(
            env.request,
            Request::MarkAttendance { booking_id: bid, status: BookingStatus::Absent }
        );
    }

    #[test]
    fn unknown_op_rejected() {
        assert!(serde_json::from_str::<Envelope>(r#"{"op":"dropTables"}"#).is_err());
    }

    #[test]
    fn listing_renders_date_and_time() {
        let info = ClassInfo {
            id: Ulid::new(),
            site_id: 2,
            name: Some("Spin".into()),
            // 2024-03-05 18:30 UTC
            starts_at: 1_709_663_400_000,
            ends_at: 1_709_667_000_000,
            capacity: 20,
            enrolled: 4,
            waitlisted: 0,
        };
        let row = ClassListing::from(info);
        assert_eq!(row.date, "2024-03-05");
        assert_eq!(row.time, "18:30");
        let v = serde_json::to_value(&row).unwrap();
        assert_eq!(v["siteId"], 2);
        assert_eq!(v["startsAt"], 1_709_663_400_000i64);
    }

    #[test]
    fn restricted_error_carries_until() {
        let v = engine_error_json(&EngineError::RestrictedUser { until: 99 });
        assert_eq!(v["error"]["code"], "RESTRICTED");
        assert_eq!(v["error"]["status"], 403);
        assert_eq!(v["error"]["restrictionUntil"], 99);

        let v = engine_error_json(&EngineError::CapacityFull(Ulid::new()));
        assert!(v["error"].get("restrictionUntil").is_none());
    }

    #[test]
    fn policy_window_shape() {
        let w = CurrentWindow::from(PolicySnapshot {
            user_id: "ana".into(),
            strike_count: 2,
            threshold: 3,
            restricted: false,
            restriction_until: None,
            window_start: 0,
            window_end: 10,
            restriction_duration_minutes: 1440,
            remaining_ms: 0,
        });
        let v = serde_json::to_value(w).unwrap();
        assert_eq!(v["noShows"], 2);
        assert_eq!(v["minutes"], 1440);
        assert_eq!(v["restrictionUntil"], Value::Null);
    }
}
