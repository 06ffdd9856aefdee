use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, LocalNow};

impl Engine {
    /// Bookable slots for one (service, date, duration), ordered by start.
    /// Unknown services read as an empty day.
    pub async fn available_slots(
        &self,
        service_id: Ulid,
        date: NaiveDate,
        duration: Minute,
    ) -> Result<Vec<ComputedSlot>, EngineError> {
        self.available_slots_at(service_id, date, duration, None, &LocalNow::current())
            .await
    }

    /// Like `available_slots`, but units held by reservation `own` count as
    /// free, so a caller holding a claim still sees its own slot.
    pub async fn available_slots_for(
        &self,
        service_id: Ulid,
        date: NaiveDate,
        duration: Minute,
        own: Option<Ulid>,
    ) -> Result<Vec<ComputedSlot>, EngineError> {
        self.available_slots_at(service_id, date, duration, own, &LocalNow::current())
            .await
    }

    pub(crate) async fn available_slots_at(
        &self,
        service_id: Ulid,
        date: NaiveDate,
        duration: Minute,
        own: Option<Ulid>,
        now: &LocalNow,
    ) -> Result<Vec<ComputedSlot>, EngineError> {
        let Some(rs) = self.get_service(&service_id) else {
            return Ok(vec![]);
        };
        let guard = rs.read().await;
        if !guard.service.supports(duration) {
            return Err(EngineError::UnsupportedDuration(duration));
        }
        let cal = self.calendar.read().await;
        Ok(self.slots_in(&guard, &cal, date, duration, own, now))
    }

    /// Active profile in force on `date`, after overrides.
    pub async fn effective_working_hours(&self, date: NaiveDate) -> Option<WorkingHours> {
        let cal = self.calendar.read().await;
        cal.effective(date).cloned()
    }

    pub async fn service(&self, id: Ulid) -> Option<Service> {
        let rs = self.get_service(&id)?;
        let guard = rs.read().await;
        Some(guard.service.clone())
    }

    pub async fn list_services(&self) -> Vec<Service> {
        let shared: Vec<_> = self.services.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(shared.len());
        for rs in shared {
            out.push(rs.read().await.service.clone());
        }
        out.sort_by_key(|s| s.id);
        out
    }

    /// Raw units for a (service, date), including taken ones.
    pub async fn units(&self, service_id: Ulid, date: NaiveDate) -> Vec<AvailabilityUnit> {
        let Some(rs) = self.get_service(&service_id) else {
            return vec![];
        };
        let guard = rs.read().await;
        guard.units(date).to_vec()
    }
}
