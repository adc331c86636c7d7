use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, SharedClassState};

impl Engine {
    fn class_handles(&self) -> Vec<SharedClassState> {
        self.classes.iter().map(|e| e.value().clone()).collect()
    }

    pub async fn class_info(&self, class_id: Ulid) -> Result<ClassInfo, EngineError> {
        let rs = self
            .get_class(&class_id)
            .ok_or(EngineError::ClassNotFound(class_id))?;
        let guard = rs.read().await;
        Ok(guard.info())
    }

    /// Sessions ordered by start time, optionally limited to one site.
    pub async fn list_classes(&self, site_id: Option<u32>) -> Vec<ClassInfo> {
        let mut out = Vec::new();
        for rs in self.class_handles() {
            let guard = rs.read().await;
            if guard.removed || site_id.is_some_and(|s| s != guard.site_id) {
                continue;
            }
            out.push(guard.info());
        }
        out.sort_by_key(|c| (c.starts_at, c.id));
        out
    }

    /// A user's RESERVED bookings, soonest first.
    pub async fn user_bookings(&self, user_id: &str, site_id: Option<u32>) -> Vec<BookingView> {
        self.user_views(user_id, site_id, BookingStatus::Reserved).await
    }

    /// A user's WAITLIST entries with their current positions.
    pub async fn user_waitlists(&self, user_id: &str, site_id: Option<u32>) -> Vec<BookingView> {
        self.user_views(user_id, site_id, BookingStatus::Waitlist).await
    }

    async fn user_views(
        &self,
        user_id: &str,
        site_id: Option<u32>,
        status: BookingStatus,
    ) -> Vec<BookingView> {
        let mut out = Vec::new();
        for rs in self.class_handles() {
            let guard = rs.read().await;
            if guard.removed || site_id.is_some_and(|s| s != guard.site_id) {
                continue;
            }
            for record in guard.records_for(user_id).filter(|r| r.status == status) {
                out.push(guard.view(record));
            }
        }
        out.sort_by_key(|v| (v.starts_at, v.booking.id));
        out
    }

    /// Every booking in a class, tombstones included unless filtered out.
    pub async fn class_bookings(
        &self,
        class_id: Ulid,
        status: Option<BookingStatus>,
    ) -> Result<Vec<BookingRecord>, EngineError> {
        let rs = self
            .get_class(&class_id)
            .ok_or(EngineError::ClassNotFound(class_id))?;
        let guard = rs.read().await;
        let mut out: Vec<BookingRecord> = guard
            .bookings
            .values()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        out.sort_by_key(|r| (r.created_at, r.id));
        Ok(out)
    }

    pub async fn get_booking(&self, booking_id: Ulid) -> Result<BookingView, EngineError> {
        let class_id = self
            .class_for_booking(&booking_id)
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        let rs = self
            .get_class(&class_id)
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        let guard = rs.read().await;
        let record = guard
            .bookings
            .get(&booking_id)
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        Ok(guard.view(record))
    }

    /// 1-based waitlist position, or `NotEnrolled` if the user isn't queued.
    pub async fn waitlist_position(&self, user_id: &str, class_id: Ulid) -> Result<usize, EngineError> {
        let rs = self
            .get_class(&class_id)
            .ok_or(EngineError::ClassNotFound(class_id))?;
        let guard = rs.read().await;
        guard
            .waitlist
            .position_of(user_id)
            .ok_or(EngineError::NotEnrolled(class_id))
    }

    pub async fn get_policy(&self, user_id: &str, now: Ms) -> PolicySnapshot {
        self.strikes.get_policy(user_id, now).await
    }

    pub fn is_restricted(&self, user_id: &str, now: Ms) -> bool {
        self.strikes.is_restricted(user_id, now)
    }
}
