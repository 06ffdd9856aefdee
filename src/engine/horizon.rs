use std::collections::BTreeMap;

use chrono::{Days, NaiveDate};
use ulid::Ulid;

use crate::limits::MAX_QUERY_DAYS;
use crate::model::*;

use super::catalog::compute_slots;
use super::{Engine, EngineError, LocalNow, ServiceState};

/// Whether a (service, date) can take bookings at all, before looking at units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayStatus<'a> {
    /// Blocked, out of the booking horizon, inactive service, or no active hours.
    Closed,
    Open {
        hours: &'a WorkingHours,
        /// Earliest start still bookable; set only on today's date.
        not_before: Option<Minute>,
    },
}

impl Engine {
    /// Last bookable date counted from `today`.
    pub fn horizon_end(&self, today: NaiveDate) -> NaiveDate {
        today
            .checked_add_days(Days::new(u64::from(self.config.max_days_ahead)))
            .unwrap_or(NaiveDate::MAX)
    }

    pub(super) fn day_status<'c>(
        &self,
        service: &Service,
        cal: &'c Calendar,
        date: NaiveDate,
        now: &LocalNow,
    ) -> DayStatus<'c> {
        if !service.active || cal.is_blocked(date) {
            return DayStatus::Closed;
        }
        if date < now.today || date > self.horizon_end(now.today) {
            return DayStatus::Closed;
        }
        let Some(hours) = cal.effective(date) else {
            return DayStatus::Closed;
        };
        let not_before = (date == now.today).then(|| {
            now.minute
                .saturating_add(self.config.min_notice_minutes)
                .min(MINUTES_PER_DAY)
        });
        DayStatus::Open { hours, not_before }
    }

    /// The one query both the catalog and the horizon derive from.
    pub(super) fn slots_in(
        &self,
        state: &ServiceState,
        cal: &Calendar,
        date: NaiveDate,
        duration: Minute,
        own: Option<Ulid>,
        now: &LocalNow,
    ) -> Vec<ComputedSlot> {
        match self.day_status(&state.service, cal, date, now) {
            DayStatus::Closed => Vec::new(),
            DayStatus::Open { hours, not_before } => {
                compute_slots(state.units(date), hours, duration, own, not_before)
            }
        }
    }

    /// Dates in `[start, end]` that cannot be booked for `service_id`, with the reason.
    ///
    /// `fully_booked` means the day is open but every supported duration has
    /// an empty catalog. Everything else that keeps a date closed is `blocked`.
    pub async fn unavailable_dates(
        &self,
        service_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DateAvailability>, EngineError> {
        self.unavailable_dates_at(service_id, start, end, &LocalNow::current())
            .await
    }

    pub(crate) async fn unavailable_dates_at(
        &self,
        service_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
        now: &LocalNow,
    ) -> Result<Vec<DateAvailability>, EngineError> {
        let dates = query_range(start, end)?;
        let Some(rs) = self.get_service(&service_id) else {
            return Ok(dates
                .map(|date| DateAvailability {
                    date,
                    reason: UnavailableReason::Blocked,
                })
                .collect());
        };
        let guard = rs.read().await;
        let cal = self.calendar.read().await;

        let mut out = Vec::new();
        for date in dates {
            let reason = match self.day_status(&guard.service, &cal, date, now) {
                DayStatus::Closed => Some(UnavailableReason::Blocked),
                DayStatus::Open { .. } => {
                    let bookable = guard.service.durations.iter().any(|&d| {
                        !self.slots_in(&guard, &cal, date, d, None, now).is_empty()
                    });
                    (!bookable).then_some(UnavailableReason::FullyBooked)
                }
            };
            if let Some(reason) = reason {
                out.push(DateAvailability { date, reason });
            }
        }
        Ok(out)
    }

    /// Remaining open slots of the service's shortest duration, per date in
    /// range that falls inside the booking horizon.
    pub async fn slot_counts(
        &self,
        service_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<BTreeMap<NaiveDate, usize>, EngineError> {
        self.slot_counts_at(service_id, start, end, &LocalNow::current())
            .await
    }

    pub(crate) async fn slot_counts_at(
        &self,
        service_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
        now: &LocalNow,
    ) -> Result<BTreeMap<NaiveDate, usize>, EngineError> {
        let dates = query_range(start, end)?;
        let mut counts = BTreeMap::new();
        let Some(rs) = self.get_service(&service_id) else {
            return Ok(counts);
        };
        let guard = rs.read().await;
        let Some(duration) = guard.service.shortest_duration() else {
            return Ok(counts);
        };
        let cal = self.calendar.read().await;
        let last = self.horizon_end(now.today);
        for date in dates.filter(|d| *d >= now.today && *d <= last) {
            let n = self.slots_in(&guard, &cal, date, duration, None, now).len();
            counts.insert(date, n);
        }
        Ok(counts)
    }
}

/// Inclusive date iterator, rejecting ranges wider than the query limit.
fn query_range(
    start: NaiveDate,
    end: NaiveDate,
) -> Result<impl Iterator<Item = NaiveDate>, EngineError> {
    if (end - start).num_days() >= MAX_QUERY_DAYS {
        return Err(EngineError::LimitExceeded("date range too wide"));
    }
    Ok(start.iter_days().take_while(move |d| *d <= end))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    #[test]
    fn range_is_inclusive() {
        let days: Vec<_> = query_range(d("2026-10-20"), d("2026-10-22")).unwrap().collect();
        assert_eq!(days, vec![d("2026-10-20"), d("2026-10-21"), d("2026-10-22")]);
    }

    #[test]
    fn reversed_range_is_empty() {
        assert_eq!(query_range(d("2026-10-22"), d("2026-10-20")).unwrap().count(), 0);
    }

    #[test]
    fn oversized_range_rejected() {
        assert!(matches!(
            query_range(d("2026-01-01"), d("2027-12-31")),
            Err(EngineError::LimitExceeded(_))
        ));
    }
}
