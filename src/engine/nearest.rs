use std::cmp::Reverse;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, LocalNow};

/// The available slot whose start is closest to `desired`. Equidistant
/// candidates resolve to the later one.
pub fn nearest_slot(slots: &[ComputedSlot], desired: Minute) -> Option<&ComputedSlot> {
    slots
        .iter()
        .filter(|s| s.is_available)
        .min_by_key(|s| (s.span.start.abs_diff(desired), Reverse(s.span.start)))
}

impl Engine {
    /// Recomputes the day's catalog from current state; never trusts a cached list.
    pub async fn find_nearest_available_slot(
        &self,
        service_id: Ulid,
        date: NaiveDate,
        desired: Minute,
        duration: Minute,
    ) -> Result<Option<ComputedSlot>, EngineError> {
        let Some(rs) = self.get_service(&service_id) else {
            return Ok(None);
        };
        let guard = rs.read().await;
        if !guard.service.supports(duration) {
            return Err(EngineError::UnsupportedDuration(duration));
        }
        let cal = self.calendar.read().await;
        let slots = self.slots_in(&guard, &cal, date, duration, None, &LocalNow::current());
        Ok(nearest_slot(&slots, desired).cloned())
    }
}
