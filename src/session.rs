use std::fmt;
use std::sync::Arc;

use chrono::NaiveDate;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use ulid::Ulid;

use crate::backend::{
    BookingHandoff, ContactDetails, Identity, PaymentReceipt, RecordSink, SlotBackend,
};
use crate::engine::EngineError;
use crate::model::*;
use crate::observability::FOLLOW_UP_FAILURES_TOTAL;
use crate::sync::{LiveSync, SlotView, SyncError, SyncOptions, SyncPhase, ViewKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    SelectingDate,
    SelectingDuration,
    SelectingSlot,
    CollectingDetails,
    Paying,
    Confirmed,
}

/// User-facing explanation after the flow was pushed back to slot selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guidance {
    /// Lost the race for the slot. The suggestion is advice, never auto-selected.
    SlotTaken { suggestion: Option<ComputedSlot> },
    /// The selected slot disappeared before submission.
    StaleSelection,
    /// The claim lapsed before the booking was completed.
    HoldExpired,
}

impl fmt::Display for Guidance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Guidance::SlotTaken {
                suggestion: Some(slot),
            } => write!(
                f,
                "That time was just booked by someone else. The closest available time is {}.",
                slot.start_clock()
            ),
            Guidance::SlotTaken { suggestion: None } => write!(
                f,
                "That time was just booked by someone else and no other times remain on this day."
            ),
            Guidance::StaleSelection => write!(
                f,
                "The time you picked is no longer available. Please choose another."
            ),
            Guidance::HoldExpired => write!(
                f,
                "Your hold on this time ran out before the booking was completed. Please choose a time again."
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub reference: String,
    pub reservation: Reservation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Confirmed(Confirmation),
    /// Slot is claimed; the service takes payment before the record is written.
    NeedsPayment,
    /// Back in `SelectingSlot` with guidance.
    Conflict(Guidance),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("cannot {action} while {step:?}")]
    InvalidStep { action: &'static str, step: Step },
    #[error("a reservation request is already in flight")]
    SubmitInFlight,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("slot {0} is not offered")]
    UnknownSlot(Ulid),
    #[error("{date} is not bookable ({})", reason.as_str())]
    DateUnavailable {
        date: NaiveDate,
        reason: UnavailableReason,
    },
    #[error("service {0} is not available for booking")]
    ServiceUnavailable(Ulid),
    #[error(transparent)]
    Backend(#[from] EngineError),
    /// The claim was live when the hand-off started but its record was not
    /// written. Retry with `retry_finalize`; the claim expires if nobody does.
    #[error("reservation {reservation_id} is claimed but its record was not written: {reason}")]
    FollowUpFailed { reservation_id: Ulid, reason: String },
    /// The claim lapsed or was released. The session is back at slot
    /// selection; nothing was recorded against it.
    #[error("the hold on reservation {0} expired")]
    ClaimExpired(Ulid),
    #[error(transparent)]
    LiveSync(#[from] SyncError),
}

impl SessionError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::Backend(e) => e.is_retryable(),
            SessionError::FollowUpFailed { .. } => true,
            _ => false,
        }
    }
}

type PendingClaim = JoinHandle<Result<ReserveOutcome, EngineError>>;

/// One user's walk from date selection to a confirmed booking.
///
/// All state is local to the session; the only shared mutation is the
/// claim, which goes through `SlotBackend::reserve_slots`.
pub struct BookingSession<B: SlotBackend, R: RecordSink> {
    backend: Arc<B>,
    records: Arc<R>,
    identity: Option<Identity>,
    service: Service,
    step: Step,
    date: Option<NaiveDate>,
    duration: Option<Minute>,
    slots: Vec<ComputedSlot>,
    selected: Option<ComputedSlot>,
    guidance: Option<Guidance>,
    details: ContactDetails,
    /// Reused across retries of the same attempt so the claim is idempotent.
    request_id: Option<Ulid>,
    pending: Option<PendingClaim>,
    reservation: Option<Reservation>,
    payment: Option<PaymentReceipt>,
    confirmation: Option<Confirmation>,
    /// Watches the chosen (date, duration) when enabled.
    live: Option<LiveSync<B>>,
    live_rx: Option<watch::Receiver<SlotView>>,
}

impl<B: SlotBackend, R: RecordSink> BookingSession<B, R> {
    /// Open a session for an active service. Guests pass `identity: None`.
    pub async fn start(
        backend: Arc<B>,
        records: Arc<R>,
        service_id: Ulid,
        identity: Option<Identity>,
    ) -> Result<Self, SessionError> {
        let service = backend
            .service(service_id)
            .await
            .filter(|s| s.active)
            .ok_or(SessionError::ServiceUnavailable(service_id))?;
        Ok(Self {
            backend,
            records,
            identity,
            service,
            step: Step::SelectingDate,
            date: None,
            duration: None,
            slots: Vec::new(),
            selected: None,
            guidance: None,
            details: ContactDetails::default(),
            request_id: None,
            pending: None,
            reservation: None,
            payment: None,
            confirmation: None,
            live: None,
            live_rx: None,
        })
    }

    /// Keep the slot list current from pushes and polling while a date and
    /// duration are chosen. The watch follows every date or duration change
    /// and is torn down on restart and once the booking is confirmed.
    pub fn with_live_sync(mut self, options: SyncOptions) -> Self {
        self.live = Some(LiveSync::new(self.backend.clone(), options));
        self
    }

    /// `None` when live sync is not enabled.
    pub fn live_phase(&self) -> Option<SyncPhase> {
        self.live.as_ref().map(LiveSync::phase)
    }

    /// Latest live view, without applying it.
    pub fn live_view(&self) -> Option<SlotView> {
        self.live_rx.as_ref().map(|rx| rx.borrow().clone())
    }

    fn view_key(&self) -> Option<ViewKey> {
        let (date, duration) = self.date.zip(self.duration)?;
        Some(ViewKey {
            service_id: self.service.id,
            date,
            duration,
        })
    }

    async fn rewatch(&mut self) {
        let key = self.view_key();
        let Some(live) = self.live.as_mut() else {
            return;
        };
        match key {
            Some(key) => {
                live.watch(key).await;
                self.live_rx = Some(live.subscribe_view());
            }
            None => {
                live.teardown().await;
                self.live_rx = None;
            }
        }
    }

    async fn stop_live(&mut self) {
        if let Some(live) = self.live.as_mut() {
            live.teardown().await;
        }
        self.live_rx = None;
    }

    /// Take over a live view of the current (date, duration). A selection
    /// missing from it is dropped with `StaleSelection`; returns true if so.
    /// Views of another key, unloaded views, and views arriving after the
    /// claim was submitted are ignored.
    pub fn apply_view(&mut self, view: &SlotView) -> bool {
        if !view.is_loaded() || view.key.is_none() || view.key != self.view_key() {
            return false;
        }
        if !matches!(self.step, Step::SelectingSlot | Step::CollectingDetails)
            || self.pending.is_some()
            || self.reservation.is_some()
        {
            return false;
        }
        self.slots = view.slots.clone();
        let lost = self
            .selected
            .as_ref()
            .is_some_and(|sel| !self.slots.iter().any(|s| s.id == sel.id));
        if lost {
            self.drop_selection(Guidance::StaleSelection);
        }
        lost
    }

    /// Apply the newest live view, if any. Returns true if it cost the selection.
    pub fn sync_from_live(&mut self) -> bool {
        let Some(view) = self.live_rx.as_mut().map(|rx| rx.borrow_and_update().clone()) else {
            return false;
        };
        self.apply_view(&view)
    }

    /// Wait for the next live view change and apply it.
    pub async fn next_live_update(&mut self) -> Result<bool, SessionError> {
        let rx = self.live_rx.as_mut().ok_or(SyncError::NotWatching)?;
        rx.changed().await.map_err(|_| SyncError::Stopped)?;
        Ok(self.sync_from_live())
    }

    pub fn step(&self) -> Step {
        self.step
    }

    pub fn service(&self) -> &Service {
        &self.service
    }

    pub fn date(&self) -> Option<NaiveDate> {
        self.date
    }

    pub fn duration(&self) -> Option<Minute> {
        self.duration
    }

    pub fn slots(&self) -> &[ComputedSlot] {
        &self.slots
    }

    pub fn selected(&self) -> Option<&ComputedSlot> {
        self.selected.as_ref()
    }

    pub fn guidance(&self) -> Option<&Guidance> {
        self.guidance.as_ref()
    }

    pub fn details(&self) -> &ContactDetails {
        &self.details
    }

    pub fn reservation(&self) -> Option<&Reservation> {
        self.reservation.as_ref()
    }

    pub fn confirmation(&self) -> Option<&Confirmation> {
        self.confirmation.as_ref()
    }

    pub fn is_submitting(&self) -> bool {
        self.pending.is_some()
    }

    fn expect_step(&self, action: &'static str, allowed: &[Step]) -> Result<(), SessionError> {
        if allowed.contains(&self.step) {
            Ok(())
        } else {
            Err(SessionError::InvalidStep {
                action,
                step: self.step,
            })
        }
    }

    /// Dates in range the calendar must render as non-selectable.
    pub async fn closed_dates(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DateAvailability>, SessionError> {
        Ok(self
            .backend
            .unavailable_dates(self.service.id, start, end)
            .await?)
    }

    pub async fn select_date(&mut self, date: NaiveDate) -> Result<(), SessionError> {
        self.expect_step(
            "select a date",
            &[Step::SelectingDate, Step::SelectingDuration, Step::SelectingSlot],
        )?;
        if let Some(closed) = self
            .backend
            .unavailable_dates(self.service.id, date, date)
            .await?
            .into_iter()
            .next()
        {
            return Err(SessionError::DateUnavailable {
                date,
                reason: closed.reason,
            });
        }

        self.date = Some(date);
        self.selected = None;
        self.guidance = None;
        self.slots.clear();
        match self.service.durations.as_slice() {
            [only] => {
                self.duration = Some(*only);
                self.step = Step::SelectingSlot;
                self.refresh_slots().await?;
            }
            _ => {
                self.duration = None;
                self.step = Step::SelectingDuration;
            }
        }
        self.rewatch().await;
        Ok(())
    }

    pub async fn select_duration(&mut self, duration: Minute) -> Result<(), SessionError> {
        self.expect_step(
            "select a duration",
            &[Step::SelectingDuration, Step::SelectingSlot],
        )?;
        if !self.service.supports(duration) {
            return Err(EngineError::UnsupportedDuration(duration).into());
        }
        self.duration = Some(duration);
        self.selected = None;
        self.guidance = None;
        self.step = Step::SelectingSlot;
        self.refresh_slots().await?;
        self.rewatch().await;
        Ok(())
    }

    /// Re-read the slot list. A selection that vanished is cleared with guidance.
    pub async fn refresh_slots(&mut self) -> Result<&[ComputedSlot], SessionError> {
        self.expect_step("list slots", &[Step::SelectingSlot, Step::CollectingDetails])?;
        let (date, duration) = self.date.zip(self.duration).ok_or(SessionError::MissingField("date"))?;
        self.slots = self
            .backend
            .available_slots(self.service.id, date, duration)
            .await?;
        if let Some(sel) = &self.selected
            && !self.slots.iter().any(|s| s.id == sel.id)
        {
            self.drop_selection(Guidance::StaleSelection);
        }
        Ok(&self.slots)
    }

    pub fn select_slot(&mut self, slot_id: Ulid) -> Result<(), SessionError> {
        self.expect_step("select a slot", &[Step::SelectingSlot])?;
        let slot = self
            .slots
            .iter()
            .find(|s| s.id == slot_id)
            .cloned()
            .ok_or(SessionError::UnknownSlot(slot_id))?;
        self.selected = Some(slot);
        self.guidance = None;
        Ok(())
    }

    /// Explicitly take the time proposed after a lost race.
    pub async fn accept_suggestion(&mut self) -> Result<ComputedSlot, SessionError> {
        self.expect_step("accept a suggestion", &[Step::SelectingSlot])?;
        let Some(Guidance::SlotTaken {
            suggestion: Some(suggested),
        }) = self.guidance.clone()
        else {
            return Err(SessionError::MissingField("suggestion"));
        };
        self.refresh_slots().await?;
        if !self.slots.iter().any(|s| s.id == suggested.id) {
            self.guidance = Some(Guidance::StaleSelection);
            return Err(SessionError::UnknownSlot(suggested.id));
        }
        self.select_slot(suggested.id)?;
        Ok(suggested)
    }

    /// Called when live sync reports `slot_id` taken. Returns true if it was
    /// the current selection.
    pub fn invalidate_slot(&mut self, slot_id: Ulid) -> bool {
        self.slots.retain(|s| s.id != slot_id);
        let hit = self.selected.as_ref().is_some_and(|s| s.id == slot_id)
            && matches!(self.step, Step::SelectingSlot | Step::CollectingDetails)
            && self.pending.is_none()
            && self.reservation.is_none();
        if hit {
            self.drop_selection(Guidance::StaleSelection);
        }
        hit
    }

    fn drop_selection(&mut self, guidance: Guidance) {
        self.selected = None;
        self.request_id = None;
        self.guidance = Some(guidance);
        if self.step == Step::CollectingDetails && self.reservation.is_none() {
            self.step = Step::SelectingSlot;
        }
    }

    /// Move on to contact details, pre-filling from the signed-in identity.
    pub fn continue_to_details(&mut self) -> Result<(), SessionError> {
        self.expect_step("enter details", &[Step::SelectingSlot])?;
        if self.selected.is_none() {
            return Err(SessionError::MissingField("slot"));
        }
        if let Some(id) = &self.identity {
            fill_blank(&mut self.details.full_name, &id.full_name);
            fill_blank(&mut self.details.email, &id.email);
            fill_blank(&mut self.details.phone, &id.phone);
        }
        self.step = Step::CollectingDetails;
        Ok(())
    }

    /// Return to the slot list before submitting. Entered details are kept.
    pub fn back_to_slots(&mut self) -> Result<(), SessionError> {
        self.expect_step("change the slot", &[Step::CollectingDetails])?;
        if self.pending.is_some() || self.reservation.is_some() {
            return Err(SessionError::SubmitInFlight);
        }
        self.step = Step::SelectingSlot;
        Ok(())
    }

    pub fn set_details(&mut self, details: ContactDetails) -> Result<(), SessionError> {
        self.expect_step("edit details", &[Step::CollectingDetails])?;
        if self.reservation.is_some() {
            return Err(SessionError::SubmitInFlight);
        }
        self.details = details;
        Ok(())
    }

    /// Claim the selected slot. On conflict the session drops back to slot
    /// selection with the nearest alternative as guidance.
    pub async fn submit(&mut self) -> Result<SubmitOutcome, SessionError> {
        self.expect_step("submit", &[Step::CollectingDetails])?;
        if self.pending.is_some() || self.reservation.is_some() {
            return Err(SessionError::SubmitInFlight);
        }
        if self.sync_from_live() {
            return Ok(SubmitOutcome::Conflict(Guidance::StaleSelection));
        }
        let slot = self.selected.clone().ok_or(SessionError::MissingField("slot"))?;
        let (date, duration) = self.date.zip(self.duration).ok_or(SessionError::MissingField("date"))?;
        for (field, value) in [
            ("full_name", &self.details.full_name),
            ("email", &self.details.email),
            ("phone", &self.details.phone),
        ] {
            if value.trim().is_empty() {
                return Err(SessionError::MissingField(field));
            }
        }

        let req = ReservationRequest {
            id: *self.request_id.get_or_insert_with(Ulid::new),
            slot_id: slot.id,
            service_id: self.service.id,
            date,
            span: slot.span,
            duration,
        };
        let backend = self.backend.clone();
        // Spawned so the claim runs to completion even if this future is dropped.
        self.pending = Some(tokio::spawn(async move { backend.reserve_slots(req).await }));
        self.finish_pending().await
    }

    /// Resolve a claim whose submitting future was dropped. `None` when idle.
    pub async fn reconcile_pending(&mut self) -> Result<Option<SubmitOutcome>, SessionError> {
        if self.pending.is_none() {
            return Ok(None);
        }
        self.finish_pending().await.map(Some)
    }

    async fn finish_pending(&mut self) -> Result<SubmitOutcome, SessionError> {
        let Some(handle) = self.pending.as_mut() else {
            return Err(SessionError::InvalidStep {
                action: "await a reservation",
                step: self.step,
            });
        };
        let joined = handle.await;
        self.pending = None;
        let outcome = joined.map_err(|e| EngineError::Unavailable(e.to_string()))??;

        match outcome {
            ReserveOutcome::Reserved(reservation) => {
                info!(
                    "reservation {} claimed {} {}",
                    reservation.id,
                    format_date(reservation.date),
                    reservation.span
                );
                let id = reservation.id;
                self.reservation = Some(reservation);
                if self.service.requires_payment {
                    self.step = Step::Paying;
                    // A retried request id may return an older claim; give
                    // the payment a full window.
                    self.touch_claim(id).await?;
                    Ok(SubmitOutcome::NeedsPayment)
                } else {
                    self.finalize().await.map(SubmitOutcome::Confirmed)
                }
            }
            ReserveOutcome::Conflict => {
                let desired = self.selected.as_ref().map_or(0, |s| s.span.start);
                let (date, duration) = self
                    .date
                    .zip(self.duration)
                    .ok_or(SessionError::MissingField("date"))?;
                let suggestion = self
                    .backend
                    .find_nearest_available_slot(self.service.id, date, desired, duration)
                    .await?;
                self.selected = None;
                self.request_id = None;
                self.step = Step::SelectingSlot;
                self.slots = self
                    .backend
                    .available_slots(self.service.id, date, duration)
                    .await?;
                let guidance = Guidance::SlotTaken { suggestion };
                self.guidance = Some(guidance.clone());
                Ok(SubmitOutcome::Conflict(guidance))
            }
        }
    }

    /// Renew the claim while the user is still paying or retrying.
    pub async fn keep_alive(&mut self) -> Result<(), SessionError> {
        self.expect_step("keep the hold", &[Step::CollectingDetails, Step::Paying])?;
        let id = self
            .reservation
            .as_ref()
            .map(|r| r.id)
            .ok_or(SessionError::MissingField("reservation"))?;
        self.touch_claim(id).await
    }

    async fn touch_claim(&mut self, id: Ulid) -> Result<(), SessionError> {
        match self.backend.extend_claim(id).await {
            Ok(reservation) => {
                self.reservation = Some(reservation);
                Ok(())
            }
            Err(EngineError::ClaimExpired(_) | EngineError::NotFound(_)) => {
                Err(self.claim_lost(id).await)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The claim is gone: back to slot selection with a fresh list.
    async fn claim_lost(&mut self, id: Ulid) -> SessionError {
        warn!(
            target: "slotbook::orphan",
            reservation_id = %id,
            payment = ?self.payment.as_ref().map(|p| &p.intent_id),
            "claim lapsed before the booking was completed"
        );
        self.reservation = None;
        self.payment = None;
        self.selected = None;
        self.request_id = None;
        self.guidance = Some(Guidance::HoldExpired);
        self.step = Step::SelectingSlot;
        if let Some((date, duration)) = self.date.zip(self.duration) {
            match self
                .backend
                .available_slots(self.service.id, date, duration)
                .await
            {
                Ok(slots) => self.slots = slots,
                Err(e) => info!("slot list not refreshed after lapsed claim: {e}"),
            }
        }
        SessionError::ClaimExpired(id)
    }

    pub async fn confirm_payment(
        &mut self,
        receipt: PaymentReceipt,
    ) -> Result<Confirmation, SessionError> {
        self.expect_step("confirm payment", &[Step::Paying])?;
        if receipt.intent_id.trim().is_empty() {
            return Err(SessionError::MissingField("intent_id"));
        }
        self.payment = Some(receipt);
        self.finalize().await
    }

    /// Retry the record hand-off for a claim whose follow-up failed.
    pub async fn retry_finalize(&mut self) -> Result<Confirmation, SessionError> {
        self.expect_step("retry the booking record", &[Step::CollectingDetails, Step::Paying])?;
        if self.reservation.is_none() {
            return Err(SessionError::MissingField("reservation"));
        }
        if self.service.requires_payment && self.payment.is_none() {
            return Err(SessionError::MissingField("payment"));
        }
        self.finalize().await
    }

    async fn finalize(&mut self) -> Result<Confirmation, SessionError> {
        let reservation = self
            .reservation
            .clone()
            .ok_or(SessionError::MissingField("reservation"))?;
        // Nothing is recorded against a claim that already lapsed, and a live
        // one gets a full window for the hand-off.
        self.touch_claim(reservation.id).await?;

        let handoff = BookingHandoff {
            reservation_id: reservation.id,
            slot_id: reservation.slot_id,
            service_id: reservation.service_id,
            kind: self.service.kind,
            date: reservation.date,
            start: format_clock(reservation.span.start),
            end: format_clock(reservation.span.end),
            duration: reservation.duration,
            contact: self.details.clone(),
            payment: self.payment.clone(),
        };

        let reference = match self.records.record(&handoff).await {
            Ok(reference) => reference,
            Err(e) => return Err(self.follow_up_failed(&reservation, e.to_string())),
        };
        match self
            .backend
            .finalize_reservation(reservation.id, &reference)
            .await
        {
            Ok(reservation) => {
                info!("reservation {} confirmed as {reference}", reservation.id);
                let confirmation = Confirmation {
                    reference,
                    reservation: reservation.clone(),
                };
                self.reservation = Some(reservation);
                self.confirmation = Some(confirmation.clone());
                self.step = Step::Confirmed;
                self.stop_live().await;
                Ok(confirmation)
            }
            Err(EngineError::NotFound(_)) => {
                error!(
                    target: "slotbook::orphan",
                    reservation_id = %reservation.id,
                    reference = %reference,
                    "booking record written after its claim was released"
                );
                Err(self.claim_lost(reservation.id).await)
            }
            Err(e) => Err(self.follow_up_failed(&reservation, e.to_string())),
        }
    }

    fn follow_up_failed(&self, reservation: &Reservation, reason: String) -> SessionError {
        metrics::counter!(FOLLOW_UP_FAILURES_TOTAL).increment(1);
        error!(
            target: "slotbook::orphan",
            reservation_id = %reservation.id,
            service_id = %reservation.service_id,
            date = %format_date(reservation.date),
            span = %reservation.span,
            "slot claimed but booking record not written: {reason}"
        );
        SessionError::FollowUpFailed {
            reservation_id: reservation.id,
            reason,
        }
    }

    /// Discard all session state and start over at date selection. An
    /// in-flight claim is awaited first, never abandoned.
    pub async fn restart(&mut self) {
        if self.pending.is_some()
            && let Err(e) = self.reconcile_pending().await
        {
            info!("claim settled during restart: {e}");
        }
        if let Some(r) = &self.reservation
            && self.confirmation.is_none()
        {
            info!(
                "restarting with unfinalized reservation {}; it will expire",
                r.id
            );
        }
        self.stop_live().await;
        self.step = Step::SelectingDate;
        self.date = None;
        self.duration = None;
        self.slots.clear();
        self.selected = None;
        self.guidance = None;
        self.details = ContactDetails::default();
        self.request_id = None;
        self.reservation = None;
        self.payment = None;
        self.confirmation = None;
    }
}

/// Copy `source` into `field` only if the user has not typed anything.
fn fill_blank(field: &mut String, source: &Option<String>) {
    if field.trim().is_empty()
        && let Some(value) = source
    {
        *field = value.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RecordError;
    use crate::config::EngineConfig;
    use crate::engine::Engine;
    use crate::notify::NotifyHub;
    use crate::reaper::sweep_expired;
    use crate::reference::LocalRecordBook;
    use crate::sync::SyncWarning;
    use async_trait::async_trait;
    use std::time::Duration;
    use chrono::{Days, Weekday};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_session");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn tomorrow() -> NaiveDate {
        chrono::Local::now().date_naive() + Days::new(1)
    }

    /// Engine open 09:00-17:00 every day with a 12:00-13:00 break and
    /// 30-minute units 09:00-12:00 tomorrow.
    async fn setup(name: &str, kind: ServiceKind, durations: Vec<Minute>) -> (Arc<Engine>, Ulid) {
        setup_with(name, kind, durations, EngineConfig::default()).await
    }

    async fn setup_with(
        name: &str,
        kind: ServiceKind,
        durations: Vec<Minute>,
        config: EngineConfig,
    ) -> (Arc<Engine>, Ulid) {
        let engine =
            Arc::new(Engine::new(test_wal_path(name), Arc::new(NotifyHub::new()), config).unwrap());
        for wd in [
            Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu,
            Weekday::Fri, Weekday::Sat, Weekday::Sun,
        ] {
            engine
                .set_weekly_hours(wd, Some(WorkingHours::new(540, 1020, vec![Span::new(720, 780)])))
                .await
                .unwrap();
        }
        let sid = Ulid::new();
        let requires_payment = kind == ServiceKind::Wakala;
        engine
            .create_service(sid, kind, "Bureau".into(), "مكتب".into(), durations, requires_payment)
            .await
            .unwrap();
        let units = (540..720)
            .step_by(30)
            .map(|m| (Ulid::new(), Span::new(m, m + 30)))
            .collect();
        engine.publish_units(sid, tomorrow(), units).await.unwrap();
        (engine, sid)
    }

    fn contact() -> ContactDetails {
        ContactDetails {
            full_name: "Omar Saleh".into(),
            email: "omar@example.org".into(),
            phone: "+96550000000".into(),
            ..ContactDetails::default()
        }
    }

    fn slot_at(session: &BookingSession<Engine, LocalRecordBook>, start: Minute) -> Ulid {
        session
            .slots()
            .iter()
            .find(|s| s.span.start == start)
            .map(|s| s.id)
            .expect("slot listed")
    }

    async fn at_details(
        engine: &Arc<Engine>,
        records: &Arc<LocalRecordBook>,
        sid: Ulid,
        start: Minute,
    ) -> BookingSession<Engine, LocalRecordBook> {
        let mut s = BookingSession::start(engine.clone(), records.clone(), sid, None)
            .await
            .unwrap();
        s.select_date(tomorrow()).await.unwrap();
        let id = slot_at(&s, start);
        s.select_slot(id).unwrap();
        s.continue_to_details().unwrap();
        s.set_details(contact()).unwrap();
        s
    }

    struct FlakyRecords {
        fail: AtomicBool,
        inner: LocalRecordBook,
    }

    #[async_trait]
    impl RecordSink for FlakyRecords {
        async fn record(&self, handoff: &BookingHandoff) -> Result<String, RecordError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(RecordError::Unavailable("connection reset".into()));
            }
            self.inner.record(handoff).await
        }
    }

    #[tokio::test]
    async fn single_duration_service_skips_duration_step() {
        let (engine, sid) = setup("single_duration.wal", ServiceKind::Advisory, vec![30]).await;
        let records = Arc::new(LocalRecordBook::new());
        let mut s = BookingSession::start(engine, records, sid, None).await.unwrap();
        assert_eq!(s.step(), Step::SelectingDate);
        s.select_date(tomorrow()).await.unwrap();
        assert_eq!(s.step(), Step::SelectingSlot);
        assert_eq!(s.duration(), Some(30));
        assert_eq!(s.slots().len(), 6);
    }

    #[tokio::test]
    async fn multi_duration_service_asks_for_duration() {
        let (engine, sid) = setup("multi_duration.wal", ServiceKind::Advisory, vec![30, 60]).await;
        let records = Arc::new(LocalRecordBook::new());
        let mut s = BookingSession::start(engine, records, sid, None).await.unwrap();
        s.select_date(tomorrow()).await.unwrap();
        assert_eq!(s.step(), Step::SelectingDuration);
        assert!(s.select_slot(Ulid::new()).is_err());
        s.select_duration(60).await.unwrap();
        assert_eq!(s.step(), Step::SelectingSlot);
        assert_eq!(s.slots().len(), 5);
        assert!(matches!(
            s.select_duration(45).await,
            Err(SessionError::Backend(EngineError::UnsupportedDuration(45)))
        ));
    }

    #[tokio::test]
    async fn advisory_booking_confirms_with_reference() {
        let (engine, sid) = setup("advisory_confirm.wal", ServiceKind::Advisory, vec![30]).await;
        let records = Arc::new(LocalRecordBook::new());
        let mut s = at_details(&engine, &records, sid, 600).await;

        let SubmitOutcome::Confirmed(c) = s.submit().await.unwrap() else {
            panic!("expected confirmation");
        };
        assert_eq!(s.step(), Step::Confirmed);
        assert!(c.reference.starts_with("ADV-"));
        assert_eq!(
            engine.reservation_by_reference(&c.reference).await.map(|r| r.id),
            Some(c.reservation.id)
        );
        assert!(records.lookup(&c.reference).is_some());
        assert!(matches!(s.submit().await, Err(SessionError::InvalidStep { .. })));
    }

    #[tokio::test]
    async fn wakala_booking_waits_for_payment() {
        let (engine, sid) = setup("wakala_payment.wal", ServiceKind::Wakala, vec![30]).await;
        let records = Arc::new(LocalRecordBook::new());
        let mut s = at_details(&engine, &records, sid, 540).await;

        assert_eq!(s.submit().await.unwrap(), SubmitOutcome::NeedsPayment);
        assert_eq!(s.step(), Step::Paying);
        assert!(records.is_empty());

        let c = s
            .confirm_payment(PaymentReceipt { intent_id: "pi_123".into() })
            .await
            .unwrap();
        assert!(c.reference.starts_with("WKL-"));
        assert_eq!(records.lookup(&c.reference).unwrap().payment.unwrap().intent_id, "pi_123");
    }

    #[tokio::test]
    async fn losing_the_race_suggests_nearest_later_slot() {
        let (engine, sid) = setup("race_session.wal", ServiceKind::Advisory, vec![30]).await;
        let records = Arc::new(LocalRecordBook::new());
        let mut a = at_details(&engine, &records, sid, 600).await;
        let mut b = at_details(&engine, &records, sid, 600).await;

        let (ra, rb) = tokio::join!(a.submit(), b.submit());
        let outcomes = [ra.unwrap(), rb.unwrap()];
        let wins = outcomes.iter().filter(|o| matches!(o, SubmitOutcome::Confirmed(_))).count();
        assert_eq!(wins, 1);

        let loser = if matches!(outcomes[0], SubmitOutcome::Conflict(_)) { &a } else { &b };
        assert_eq!(loser.step(), Step::SelectingSlot);
        assert!(loser.selected().is_none());
        let Some(Guidance::SlotTaken { suggestion: Some(s) }) = loser.guidance() else {
            panic!("expected a suggestion");
        };
        // 09:30 and 10:30 are equally close to 10:00; the later one wins.
        assert_eq!(s.start_clock(), "10:30");
        assert!(loser.guidance().unwrap().to_string().contains("10:30"));
    }

    #[tokio::test]
    async fn suggestion_requires_explicit_acceptance() {
        let (engine, sid) = setup("accept_suggestion.wal", ServiceKind::Advisory, vec![30]).await;
        let records = Arc::new(LocalRecordBook::new());
        let mut winner = at_details(&engine, &records, sid, 600).await;
        let mut loser = at_details(&engine, &records, sid, 600).await;
        winner.submit().await.unwrap();

        assert!(matches!(loser.submit().await.unwrap(), SubmitOutcome::Conflict(_)));
        assert!(loser.selected().is_none());
        let taken = loser.accept_suggestion().await.unwrap();
        assert_eq!(loser.selected().map(|s| s.id), Some(taken.id));

        loser.continue_to_details().unwrap();
        assert!(matches!(loser.submit().await.unwrap(), SubmitOutcome::Confirmed(_)));
    }

    #[tokio::test]
    async fn identity_prefills_without_overwriting() {
        let (engine, sid) = setup("prefill.wal", ServiceKind::Advisory, vec![30]).await;
        let records = Arc::new(LocalRecordBook::new());
        let identity = Identity {
            full_name: Some("Mona Khalil".into()),
            email: Some("mona@example.org".into()),
            phone: None,
        };
        let mut s = BookingSession::start(engine, records, sid, Some(identity)).await.unwrap();
        s.select_date(tomorrow()).await.unwrap();
        let id = slot_at(&s, 540);
        s.select_slot(id).unwrap();
        s.continue_to_details().unwrap();
        assert_eq!(s.details().full_name, "Mona Khalil");
        assert_eq!(s.details().phone, "");

        // Going back and forth keeps what the user typed.
        let mut edited = s.details().clone();
        edited.full_name = "Mona K.".into();
        s.set_details(edited).unwrap();
        s.back_to_slots().unwrap();
        s.continue_to_details().unwrap();
        assert_eq!(s.details().full_name, "Mona K.");
        assert!(matches!(s.submit().await, Err(SessionError::MissingField("phone"))));
    }

    #[tokio::test]
    async fn stale_selection_goes_back_to_slots() {
        let (engine, sid) = setup("stale.wal", ServiceKind::Advisory, vec![30]).await;
        let records = Arc::new(LocalRecordBook::new());
        let mut s = at_details(&engine, &records, sid, 660).await;
        let id = s.selected().unwrap().id;

        assert!(s.invalidate_slot(id));
        assert_eq!(s.step(), Step::SelectingSlot);
        assert_eq!(s.guidance(), Some(&Guidance::StaleSelection));
        assert!(matches!(s.submit().await, Err(SessionError::InvalidStep { .. })));
    }

    #[tokio::test]
    async fn follow_up_failure_keeps_claim_and_retries() {
        let (engine, sid) = setup("follow_up.wal", ServiceKind::Advisory, vec![30]).await;
        let records = Arc::new(FlakyRecords {
            fail: AtomicBool::new(true),
            inner: LocalRecordBook::new(),
        });
        let mut s = BookingSession::start(engine.clone(), records.clone(), sid, None)
            .await
            .unwrap();
        s.select_date(tomorrow()).await.unwrap();
        let slot = s.slots()[0].clone();
        s.select_slot(slot.id).unwrap();
        s.continue_to_details().unwrap();
        s.set_details(contact()).unwrap();

        let err = s.submit().await.unwrap_err();
        assert!(matches!(err, SessionError::FollowUpFailed { .. }));
        assert!(err.is_retryable());
        assert_eq!(s.step(), Step::CollectingDetails);
        assert!(!engine.check_slot_still_available(slot.id).await);
        assert!(matches!(s.submit().await, Err(SessionError::SubmitInFlight)));

        records.fail.store(false, Ordering::SeqCst);
        let c = s.retry_finalize().await.unwrap();
        assert_eq!(s.step(), Step::Confirmed);
        assert!(engine.get_reservation(c.reservation.id).await.unwrap().is_finalized());
    }

    #[tokio::test]
    async fn lapsed_payment_hold_records_nothing() {
        let config = EngineConfig {
            claim_ttl_ms: 50,
            ..EngineConfig::default()
        };
        let (engine, sid) = setup_with("lapsed_hold.wal", ServiceKind::Wakala, vec![30], config).await;
        let records = Arc::new(LocalRecordBook::new());
        let mut s = at_details(&engine, &records, sid, 600).await;
        let slot_id = s.selected().unwrap().id;

        assert_eq!(s.submit().await.unwrap(), SubmitOutcome::NeedsPayment);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sweep_expired(&engine, crate::engine::now_ms()).await, 1);
        assert!(engine.check_slot_still_available(slot_id).await);

        let err = s
            .confirm_payment(PaymentReceipt { intent_id: "pi_late".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::ClaimExpired(_)));
        assert!(!err.is_retryable());
        assert!(records.is_empty());
        assert_eq!(s.step(), Step::SelectingSlot);
        assert_eq!(s.guidance(), Some(&Guidance::HoldExpired));
        assert!(s.reservation().is_none() && s.selected().is_none());
        assert!(s.slots().iter().any(|x| x.id == slot_id));
        assert!(matches!(s.retry_finalize().await, Err(SessionError::InvalidStep { .. })));
    }

    #[tokio::test]
    async fn keep_alive_renews_the_payment_hold() {
        let config = EngineConfig {
            claim_ttl_ms: 300,
            ..EngineConfig::default()
        };
        let (engine, sid) = setup_with("keep_alive.wal", ServiceKind::Wakala, vec![30], config).await;
        let records = Arc::new(LocalRecordBook::new());
        let mut s = at_details(&engine, &records, sid, 630).await;
        assert_eq!(s.submit().await.unwrap(), SubmitOutcome::NeedsPayment);

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(150)).await;
            s.keep_alive().await.unwrap();
            assert_eq!(sweep_expired(&engine, crate::engine::now_ms()).await, 0);
        }
        let c = s
            .confirm_payment(PaymentReceipt { intent_id: "pi_slow".into() })
            .await
            .unwrap();
        assert!(records.lookup(&c.reference).is_some());
    }

    #[tokio::test]
    async fn live_view_drops_a_taken_selection() {
        let (engine, sid) = setup("live_session.wal", ServiceKind::Advisory, vec![30]).await;
        let records = Arc::new(LocalRecordBook::new());
        let mut slow = BookingSession::start(engine.clone(), records.clone(), sid, None)
            .await
            .unwrap()
            .with_live_sync(SyncOptions::default());
        assert_eq!(slow.live_phase(), Some(SyncPhase::Idle));
        slow.select_date(tomorrow()).await.unwrap();
        assert!(matches!(slow.live_phase(), Some(SyncPhase::Subscribed(_))));
        let target = slot_at(&slow, 600);
        slow.select_slot(target).unwrap();
        slow.continue_to_details().unwrap();
        slow.set_details(contact()).unwrap();

        let mut fast = at_details(&engine, &records, sid, 600).await;
        assert!(matches!(fast.submit().await.unwrap(), SubmitOutcome::Confirmed(_)));

        let lost = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if slow.next_live_update().await.unwrap() {
                    break;
                }
            }
        })
        .await;
        assert!(lost.is_ok(), "live view never reported the taken slot");
        assert_eq!(slow.step(), Step::SelectingSlot);
        assert_eq!(slow.guidance(), Some(&Guidance::StaleSelection));
        assert!(!slow.slots().iter().any(|s| s.id == target));
    }

    #[tokio::test]
    async fn submit_refuses_a_selection_the_live_view_lost() {
        let (engine, sid) = setup("live_submit.wal", ServiceKind::Advisory, vec![30]).await;
        let records = Arc::new(LocalRecordBook::new());
        let mut slow = BookingSession::start(engine.clone(), records.clone(), sid, None)
            .await
            .unwrap()
            .with_live_sync(SyncOptions::default());
        slow.select_date(tomorrow()).await.unwrap();
        let target = slot_at(&slow, 540);
        slow.select_slot(target).unwrap();
        slow.continue_to_details().unwrap();
        slow.set_details(contact()).unwrap();

        let mut fast = at_details(&engine, &records, sid, 540).await;
        assert!(matches!(fast.submit().await.unwrap(), SubmitOutcome::Confirmed(_)));
        tokio::time::timeout(Duration::from_secs(5), async {
            while slow
                .live_view()
                .is_none_or(|v| v.slots.iter().any(|s| s.id == target))
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // The view has not been applied yet; submit applies it instead of claiming.
        assert_eq!(slow.step(), Step::CollectingDetails);
        assert_eq!(
            slow.submit().await.unwrap(),
            SubmitOutcome::Conflict(Guidance::StaleSelection)
        );
        assert_eq!(slow.step(), Step::SelectingSlot);
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn live_sync_follows_the_flow() {
        let (engine, sid) = setup("live_follow.wal", ServiceKind::Advisory, vec![30, 60]).await;
        let records = Arc::new(LocalRecordBook::new());
        let mut s = BookingSession::start(engine.clone(), records.clone(), sid, None)
            .await
            .unwrap()
            .with_live_sync(SyncOptions::default());
        let date = tomorrow();

        s.select_date(date).await.unwrap();
        assert_eq!(s.live_phase(), Some(SyncPhase::Idle));
        s.select_duration(60).await.unwrap();
        let key = ViewKey { service_id: sid, date, duration: 60 };
        assert_eq!(s.live_phase(), Some(SyncPhase::Subscribed(key)));
        s.select_duration(30).await.unwrap();
        assert_eq!(
            s.live_phase(),
            Some(SyncPhase::Subscribed(ViewKey { duration: 30, ..key }))
        );
        assert_eq!(engine.notify.subscriber_count(&sid), 1);

        let first = s.slots()[0].id;
        s.select_slot(first).unwrap();
        s.continue_to_details().unwrap();
        s.set_details(contact()).unwrap();
        assert!(matches!(s.submit().await.unwrap(), SubmitOutcome::Confirmed(_)));
        assert_eq!(s.live_phase(), Some(SyncPhase::TornDown));
        assert_eq!(engine.notify.subscriber_count(&sid), 0);

        s.restart().await;
        s.select_date(date).await.unwrap();
        s.select_duration(30).await.unwrap();
        assert!(matches!(s.live_phase(), Some(SyncPhase::Subscribed(_))));
        s.restart().await;
        assert_eq!(s.live_phase(), Some(SyncPhase::TornDown));
        assert!(s.live_view().is_none());
    }

    #[tokio::test]
    async fn views_of_other_keys_are_ignored() {
        let (engine, sid) = setup("live_other_key.wal", ServiceKind::Advisory, vec![30]).await;
        let records = Arc::new(LocalRecordBook::new());
        let mut s = at_details(&engine, &records, sid, 540).await;
        let selected = s.selected().unwrap().id;
        let other = SlotView {
            key: Some(ViewKey {
                service_id: sid,
                date: tomorrow() + chrono::Days::new(1),
                duration: 30,
            }),
            generation: 1,
            ..SlotView::default()
        };
        assert!(!s.apply_view(&other));
        assert_eq!(s.selected().map(|x| x.id), Some(selected));

        let emptied = SlotView {
            key: Some(ViewKey { service_id: sid, date: tomorrow(), duration: 30 }),
            generation: 2,
            warning: Some(SyncWarning::SelectionLost {
                slot_id: selected,
                span: Span::new(540, 570),
            }),
            ..SlotView::default()
        };
        assert!(s.apply_view(&emptied));
        assert!(s.slots().is_empty());
        assert_eq!(s.step(), Step::SelectingSlot);
    }

    #[tokio::test]
    async fn dropped_submit_is_reconciled() {
        let (engine, sid) = setup("reconcile.wal", ServiceKind::Wakala, vec![30]).await;
        let records = Arc::new(LocalRecordBook::new());
        let mut s = at_details(&engine, &records, sid, 570).await;

        {
            let fut = s.submit();
            tokio::pin!(fut);
            // Poll once so the claim task is spawned, then abandon the future.
            let _ = futures::poll!(fut.as_mut());
        }
        assert!(s.is_submitting());
        assert_eq!(s.reconcile_pending().await.unwrap(), Some(SubmitOutcome::NeedsPayment));
        assert!(!s.is_submitting());
        assert_eq!(s.reconcile_pending().await.unwrap(), None);
    }

    #[tokio::test]
    async fn blocked_and_inactive_are_refused() {
        let (engine, sid) = setup("refused.wal", ServiceKind::Advisory, vec![30]).await;
        let records = Arc::new(LocalRecordBook::new());
        engine.block_date(tomorrow()).await.unwrap();
        let mut s = BookingSession::start(engine.clone(), records.clone(), sid, None)
            .await
            .unwrap();
        assert!(matches!(
            s.select_date(tomorrow()).await,
            Err(SessionError::DateUnavailable { reason: UnavailableReason::Blocked, .. })
        ));

        engine.set_service_active(sid, false).await.unwrap();
        assert!(matches!(
            BookingSession::start(engine, records, sid, None).await,
            Err(SessionError::ServiceUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn restart_discards_everything() {
        let (engine, sid) = setup("restart.wal", ServiceKind::Advisory, vec![30]).await;
        let records = Arc::new(LocalRecordBook::new());
        let mut s = at_details(&engine, &records, sid, 540).await;
        s.submit().await.unwrap();
        assert_eq!(s.step(), Step::Confirmed);

        s.restart().await;
        assert_eq!(s.step(), Step::SelectingDate);
        assert!(s.confirmation().is_none());
        assert!(s.details().full_name.is_empty());
        assert!(s.date().is_none());
    }
}
