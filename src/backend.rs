use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::model::*;

/// Read and claim operations the booking flow consumes.
///
/// `Engine` is the in-process implementation; a remote client or a test
/// double can stand in for it.
#[async_trait]
pub trait SlotBackend: Send + Sync + 'static {
    async fn available_slots(
        &self,
        service_id: Ulid,
        date: NaiveDate,
        duration: Minute,
    ) -> Result<Vec<ComputedSlot>, EngineError>;

    async fn unavailable_dates(
        &self,
        service_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DateAvailability>, EngineError>;

    async fn effective_working_hours(&self, date: NaiveDate) -> Option<WorkingHours>;

    async fn slot_counts(
        &self,
        service_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<BTreeMap<NaiveDate, usize>, EngineError>;

    async fn check_slot_still_available(&self, slot_id: Ulid) -> bool;

    async fn reserve_slots(&self, req: ReservationRequest) -> Result<ReserveOutcome, EngineError>;

    async fn finalize_reservation(
        &self,
        id: Ulid,
        reference: &str,
    ) -> Result<Reservation, EngineError>;

    /// Renew a live claim's expiry; `ClaimExpired`/`NotFound` once it lapsed.
    async fn extend_claim(&self, id: Ulid) -> Result<Reservation, EngineError>;

    async fn find_nearest_available_slot(
        &self,
        service_id: Ulid,
        date: NaiveDate,
        desired: Minute,
        duration: Minute,
    ) -> Result<Option<ComputedSlot>, EngineError>;

    async fn service(&self, id: Ulid) -> Option<Service>;

    /// Push channel of unit flips for one service.
    fn subscribe(&self, service_id: Ulid) -> broadcast::Receiver<SlotChange>;
}

#[async_trait]
impl SlotBackend for Engine {
    async fn available_slots(
        &self,
        service_id: Ulid,
        date: NaiveDate,
        duration: Minute,
    ) -> Result<Vec<ComputedSlot>, EngineError> {
        Engine::available_slots(self, service_id, date, duration).await
    }

    async fn unavailable_dates(
        &self,
        service_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DateAvailability>, EngineError> {
        Engine::unavailable_dates(self, service_id, start, end).await
    }

    async fn effective_working_hours(&self, date: NaiveDate) -> Option<WorkingHours> {
        Engine::effective_working_hours(self, date).await
    }

    async fn slot_counts(
        &self,
        service_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<BTreeMap<NaiveDate, usize>, EngineError> {
        Engine::slot_counts(self, service_id, start, end).await
    }

    async fn check_slot_still_available(&self, slot_id: Ulid) -> bool {
        Engine::check_slot_still_available(self, slot_id).await
    }

    async fn reserve_slots(&self, req: ReservationRequest) -> Result<ReserveOutcome, EngineError> {
        Engine::reserve_slots(self, req).await
    }

    async fn finalize_reservation(
        &self,
        id: Ulid,
        reference: &str,
    ) -> Result<Reservation, EngineError> {
        Engine::finalize_reservation(self, id, reference).await
    }

    async fn extend_claim(&self, id: Ulid) -> Result<Reservation, EngineError> {
        Engine::extend_claim(self, id).await
    }

    async fn find_nearest_available_slot(
        &self,
        service_id: Ulid,
        date: NaiveDate,
        desired: Minute,
        duration: Minute,
    ) -> Result<Option<ComputedSlot>, EngineError> {
        Engine::find_nearest_available_slot(self, service_id, date, desired, duration).await
    }

    async fn service(&self, id: Ulid) -> Option<Service> {
        Engine::service(self, id).await
    }

    fn subscribe(&self, service_id: Ulid) -> broadcast::Receiver<SlotChange> {
        self.notify.subscribe(service_id)
    }
}

// ── Domain-record hand-off ──────────────────────────────────────

/// Authenticated user, used only to pre-fill contact fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactDetails {
    pub full_name: String,
    pub email: String,
    pub phone: String,
    pub notes: Option<String>,
    /// Service-specific fields (case type, document numbers, ...).
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

/// Proof of payment from the external processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentReceipt {
    pub intent_id: String,
}

/// Everything the domain-record collaborator needs after a successful claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingHandoff {
    pub reservation_id: Ulid,
    pub slot_id: Ulid,
    pub service_id: Ulid,
    pub kind: ServiceKind,
    pub date: NaiveDate,
    pub start: String,
    pub end: String,
    pub duration: Minute,
    pub contact: ContactDetails,
    pub payment: Option<PaymentReceipt>,
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("record rejected: {0}")]
    Rejected(String),
    #[error("record store unavailable: {0}")]
    Unavailable(String),
}

/// Writes the advisory appointment or wakala application for a claim and
/// returns its booking reference. Must be idempotent per `reservation_id`.
#[async_trait]
pub trait RecordSink: Send + Sync + 'static {
    async fn record(&self, handoff: &BookingHandoff) -> Result<String, RecordError>;
}
