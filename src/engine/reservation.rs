use ulid::Ulid;

use crate::limits::MAX_REFERENCE_LEN;
use crate::model::*;
use crate::observability::RESERVATIONS_TOTAL;

use super::catalog::covering_run;
use super::{now_ms, DayStatus, Engine, EngineError, LocalNow};

impl Engine {
    /// Claim a slot if, and only if, every unit under it is still free.
    ///
    /// The check and the claim happen under the service's write lock, so two
    /// racing callers serialize here: the first flips the units, the second
    /// sees them taken and gets `Conflict` without touching anything.
    /// Re-sending a request id that already holds a claim returns that claim.
    pub async fn reserve_slots(
        &self,
        req: ReservationRequest,
    ) -> Result<ReserveOutcome, EngineError> {
        let _gate = self.write_gate().await;
        let rs = self
            .get_service(&req.service_id)
            .ok_or(EngineError::NotFound(req.service_id))?;
        let mut guard = rs.write().await;

        if let Some(existing) = guard.reservations.get(&req.id) {
            return Ok(ReserveOutcome::Reserved(existing.clone()));
        }
        if !guard.service.supports(req.duration) {
            return Err(EngineError::UnsupportedDuration(req.duration));
        }
        if Span::starting_at(req.span.start, req.duration) != Some(req.span) {
            return Err(EngineError::InvalidUnits("span does not match duration"));
        }

        let unit_ids = {
            let cal = self.calendar.read().await;
            let open = match self.day_status(&guard.service, &cal, req.date, &LocalNow::current()) {
                DayStatus::Open { hours, not_before } => {
                    hours.admits(&req.span) && not_before.is_none_or(|m| req.span.start >= m)
                }
                DayStatus::Closed => false,
            };
            let units = guard.units(req.date);
            let claimed = guard
                .unit_position(req.date, req.span.start)
                .filter(|&pos| open && units[pos].id == req.slot_id)
                .and_then(|pos| {
                    covering_run(&units[pos..], req.span, None)
                        .map(|n| units[pos..pos + n].iter().map(|u| u.id).collect::<Vec<_>>())
                });
            match claimed {
                Some(ids) => ids,
                None => {
                    metrics::counter!(RESERVATIONS_TOTAL, "outcome" => "conflict").increment(1);
                    tracing::debug!("reservation {} lost slot {}", req.id, req.slot_id);
                    return Ok(ReserveOutcome::Conflict);
                }
            }
        };

        let event = Event::ReservationClaimed {
            id: req.id,
            slot_id: req.slot_id,
            service_id: req.service_id,
            date: req.date,
            span: req.span,
            duration: req.duration,
            unit_ids,
            expires_at: now_ms() + self.config.claim_ttl_ms,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(RESERVATIONS_TOTAL, "outcome" => "reserved").increment(1);

        let reservation = guard
            .reservations
            .get(&req.id)
            .cloned()
            .ok_or(EngineError::NotFound(req.id))?;
        Ok(ReserveOutcome::Reserved(reservation))
    }

    /// Bind a booking reference to a claim, making it permanent.
    /// Repeating with the same reference is a no-op.
    pub async fn finalize_reservation(
        &self,
        id: Ulid,
        reference: &str,
    ) -> Result<Reservation, EngineError> {
        if reference.is_empty() || reference.len() > MAX_REFERENCE_LEN {
            return Err(EngineError::LimitExceeded("booking reference length"));
        }
        let _gate = self.write_gate().await;
        let service_id = self
            .reservation_index
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))?;
        let rs = self
            .get_service(&service_id)
            .ok_or(EngineError::NotFound(service_id))?;
        let mut guard = rs.write().await;
        let current = guard
            .reservations
            .get(&id)
            .ok_or(EngineError::NotFound(id))?;

        match current.reference() {
            Some(existing) if existing == reference => return Ok(current.clone()),
            Some(_) => return Err(EngineError::AlreadyFinalized(id)),
            None => {}
        }
        if self
            .references
            .get(reference)
            .is_some_and(|owner| *owner.value() != id)
        {
            return Err(EngineError::DuplicateReference(reference.to_string()));
        }

        let event = Event::ReservationFinalized {
            id,
            service_id,
            reference: reference.to_string(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        guard
            .reservations
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    /// Administrative release: the units flip back to available.
    pub async fn release_reservation(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let _gate = self.write_gate().await;
        let service_id = self
            .reservation_index
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))?;
        let rs = self
            .get_service(&service_id)
            .ok_or(EngineError::NotFound(service_id))?;
        let mut guard = rs.write().await;
        if !guard.reservations.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::ReservationReleased { id, service_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(service_id)
    }

    /// Push a live claim's expiry to `now + claim_ttl`. A finalized
    /// reservation is returned unchanged. A claim already past its expiry is
    /// `ClaimExpired` even if the reaper has not released it yet, and a
    /// released one is `NotFound`.
    pub async fn extend_claim(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.extend_claim_at(id, now_ms()).await
    }

    pub(crate) async fn extend_claim_at(&self, id: Ulid, now: Ms) -> Result<Reservation, EngineError> {
        let _gate = self.write_gate().await;
        let service_id = self
            .reservation_index
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))?;
        let rs = self
            .get_service(&service_id)
            .ok_or(EngineError::NotFound(service_id))?;
        let mut guard = rs.write().await;
        let current = guard
            .reservations
            .get(&id)
            .ok_or(EngineError::NotFound(id))?;
        match current.status {
            ReservationStatus::Finalized { .. } => return Ok(current.clone()),
            ReservationStatus::Claimed { expires_at } if expires_at <= now => {
                return Err(EngineError::ClaimExpired(id));
            }
            ReservationStatus::Claimed { .. } => {}
        }

        let event = Event::ClaimExtended {
            id,
            service_id,
            expires_at: now + self.config.claim_ttl_ms,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        guard
            .reservations
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    /// Release a claim only if it is still unfinalized and past `now`.
    /// Returns false when a finalize or another release got there first.
    pub async fn release_if_expired(&self, id: Ulid, now: Ms) -> Result<bool, EngineError> {
        let _gate = self.write_gate().await;
        let Some(service_id) = self.reservation_index.get(&id).map(|e| *e.value()) else {
            return Ok(false);
        };
        let Some(rs) = self.get_service(&service_id) else {
            return Ok(false);
        };
        let mut guard = rs.write().await;
        let expired = guard.reservations.get(&id).is_some_and(|r| {
            matches!(r.status, ReservationStatus::Claimed { expires_at } if expires_at <= now)
        });
        if !expired {
            return Ok(false);
        }
        let event = Event::ReservationReleased { id, service_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(true)
    }

    /// Unfinalized claims past their expiry, as `(reservation_id, service_id)`.
    /// Services whose lock is busy are skipped until the next sweep.
    pub fn collect_expired_claims(&self, now: Ms) -> Vec<(Ulid, Ulid)> {
        let mut expired = Vec::new();
        for entry in self.services.iter() {
            let rs = entry.value().clone();
            if let Ok(guard) = rs.try_read() {
                for r in guard.reservations.values() {
                    if let ReservationStatus::Claimed { expires_at } = r.status
                        && expires_at <= now
                    {
                        expired.push((r.id, r.service_id));
                    }
                }
            }
        }
        expired
    }

    /// Point read of one unit's flag. Advisory only; `reserve_slots` decides.
    pub async fn check_slot_still_available(&self, slot_id: Ulid) -> bool {
        let Some((service_id, date)) = self.unit_index.get(&slot_id).map(|e| *e.value()) else {
            return false;
        };
        let Some(rs) = self.get_service(&service_id) else {
            return false;
        };
        let guard = rs.read().await;
        guard
            .units(date)
            .iter()
            .find(|u| u.id == slot_id)
            .is_some_and(|u| u.is_available)
    }

    pub async fn get_reservation(&self, id: Ulid) -> Option<Reservation> {
        let service_id = *self.reservation_index.get(&id)?.value();
        let rs = self.get_service(&service_id)?;
        let guard = rs.read().await;
        guard.reservations.get(&id).cloned()
    }

    /// Lookup by the human-readable booking reference.
    pub async fn reservation_by_reference(&self, reference: &str) -> Option<Reservation> {
        let id = *self.references.get(reference)?.value();
        self.get_reservation(id).await
    }
}
