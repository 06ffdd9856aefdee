use std::sync::Arc;

use chrono::{NaiveDate, Weekday};
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, ServiceState};

impl Engine {
    pub async fn create_service(
        &self,
        id: Ulid,
        kind: ServiceKind,
        name_en: String,
        name_ar: String,
        mut durations: Vec<Minute>,
        requires_payment: bool,
    ) -> Result<(), EngineError> {
        if self.services.len() >= MAX_SERVICES {
            return Err(EngineError::LimitExceeded("too many services"));
        }
        if name_en.len() > MAX_NAME_LEN || name_ar.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("service name too long"));
        }
        durations.sort_unstable();
        durations.dedup();
        if durations.is_empty() || durations.len() > MAX_DURATIONS_PER_SERVICE {
            return Err(EngineError::LimitExceeded("service needs 1-8 durations"));
        }
        if let Some(&bad) = durations.iter().find(|&&d| d == 0 || d > MINUTES_PER_DAY) {
            return Err(EngineError::UnsupportedDuration(bad));
        }
        let _gate = self.write_gate().await;
        if self.services.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ServiceCreated {
            id,
            kind,
            name_en: name_en.clone(),
            name_ar: name_ar.clone(),
            durations: durations.clone(),
            requires_payment,
        };
        self.wal_append(&event).await?;
        let service = Service {
            id,
            kind,
            name_en,
            name_ar,
            active: true,
            durations,
            requires_payment,
        };
        self.services
            .insert(id, Arc::new(RwLock::new(ServiceState::new(service))));
        Ok(())
    }

    pub async fn set_service_active(&self, id: Ulid, active: bool) -> Result<(), EngineError> {
        let _gate = self.write_gate().await;
        let rs = self.get_service(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write().await;
        if guard.service.active == active {
            return Ok(());
        }
        self.persist_and_apply(&mut guard, &Event::ServiceActiveSet { id, active })
            .await
    }

    /// Weekly default for one weekday; `None` closes it.
    pub async fn set_weekly_hours(
        &self,
        weekday: Weekday,
        hours: Option<WorkingHours>,
    ) -> Result<(), EngineError> {
        if let Some(h) = &hours {
            check_hours(h)?;
        }
        self.persist_calendar(&Event::WeeklyHoursSet {
            weekday: weekday_index(weekday),
            hours,
        })
        .await
    }

    /// Date-specific override; `None` removes it and the weekly default applies again.
    pub async fn set_date_hours(
        &self,
        date: NaiveDate,
        hours: Option<WorkingHours>,
    ) -> Result<(), EngineError> {
        if let Some(h) = &hours {
            check_hours(h)?;
        }
        self.persist_calendar(&Event::DateHoursSet { date, hours })
            .await
    }

    pub async fn block_date(&self, date: NaiveDate) -> Result<(), EngineError> {
        self.persist_calendar(&Event::DateBlocked { date }).await
    }

    pub async fn unblock_date(&self, date: NaiveDate) -> Result<(), EngineError> {
        self.persist_calendar(&Event::DateUnblocked { date }).await
    }

    /// Add availability units for one (service, date). New units may not
    /// overlap each other or any unit already published for that date.
    pub async fn publish_units(
        &self,
        service_id: Ulid,
        date: NaiveDate,
        mut units: Vec<(Ulid, Span)>,
    ) -> Result<(), EngineError> {
        if units.is_empty() {
            return Ok(());
        }
        if units.len() > MAX_UNITS_PER_BATCH {
            return Err(EngineError::LimitExceeded("too many units in batch"));
        }
        if units
            .iter()
            .any(|(_, s)| s.start >= s.end || s.end > MINUTES_PER_DAY)
        {
            return Err(EngineError::InvalidUnits("zero-width or out-of-day unit"));
        }
        units.sort_by_key(|(_, s)| s.start);
        if units.windows(2).any(|w| w[0].1.overlaps(&w[1].1)) {
            return Err(EngineError::InvalidUnits("overlapping units"));
        }
        if let Some((dup, _)) = units.iter().find(|(id, _)| self.unit_index.contains_key(id)) {
            return Err(EngineError::AlreadyExists(*dup));
        }

        let _gate = self.write_gate().await;
        let rs = self
            .get_service(&service_id)
            .ok_or(EngineError::NotFound(service_id))?;
        let mut guard = rs.write().await;
        let existing = guard.units(date);
        if existing.len() + units.len() > MAX_UNITS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many units on date"));
        }
        if units
            .iter()
            .any(|(_, s)| existing.iter().any(|u| u.span.overlaps(s)))
        {
            return Err(EngineError::InvalidUnits("overlaps an existing unit"));
        }

        let event = Event::UnitsPublished {
            service_id,
            date,
            units,
        };
        self.persist_and_apply(&mut guard, &event).await
    }
}

fn check_hours(hours: &WorkingHours) -> Result<(), EngineError> {
    if hours.breaks.len() > MAX_BREAKS_PER_DAY {
        return Err(EngineError::LimitExceeded("too many breaks"));
    }
    hours.validate().map_err(EngineError::InvalidHours)
}
