use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use ulid::Ulid;

use crate::backend::{BookingHandoff, RecordError, RecordSink};
use crate::limits::MAX_NAME_LEN;
use crate::model::ServiceKind;

/// Random suffix length, in Crockford base32 characters.
const SUFFIX_LEN: usize = 8;

/// `ADV-20261020-7K3QX9MZ`: kind prefix, appointment date, random suffix.
pub fn booking_reference(kind: ServiceKind, date: NaiveDate, entropy: Ulid) -> String {
    let encoded = entropy.to_string();
    // The tail of a ULID is its random component.
    let suffix = &encoded[encoded.len() - SUFFIX_LEN..];
    format!("{}-{}-{suffix}", kind.reference_prefix(), date.format("%Y%m%d"))
}

/// In-process domain-record store: one record per reservation, keyed by
/// booking reference.
#[derive(Default)]
pub struct LocalRecordBook {
    by_reservation: DashMap<Ulid, String>,
    records: DashMap<String, BookingHandoff>,
}

impl LocalRecordBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, reference: &str) -> Option<BookingHandoff> {
        self.records.get(reference).map(|r| r.value().clone())
    }

    pub fn reference_for(&self, reservation_id: &Ulid) -> Option<String> {
        self.by_reservation.get(reservation_id).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn check_contact(handoff: &BookingHandoff) -> Result<(), RecordError> {
    let c = &handoff.contact;
    if c.full_name.trim().is_empty() {
        return Err(RecordError::Rejected("full name is required".into()));
    }
    if !c.email.contains('@') {
        return Err(RecordError::Rejected("email is invalid".into()));
    }
    if c.phone.trim().is_empty() {
        return Err(RecordError::Rejected("phone is required".into()));
    }
    if [&c.full_name, &c.email, &c.phone]
        .iter()
        .any(|f| f.len() > MAX_NAME_LEN)
    {
        return Err(RecordError::Rejected("contact field too long".into()));
    }
    Ok(())
}

#[async_trait]
impl RecordSink for LocalRecordBook {
    async fn record(&self, handoff: &BookingHandoff) -> Result<String, RecordError> {
        check_contact(handoff)?;
        match self.by_reservation.entry(handoff.reservation_id) {
            Entry::Occupied(existing) => Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                let reference = loop {
                    let candidate = booking_reference(handoff.kind, handoff.date, Ulid::new());
                    if let Entry::Vacant(v) = self.records.entry(candidate.clone()) {
                        v.insert(handoff.clone());
                        break candidate;
                    }
                };
                slot.insert(reference.clone());
                Ok(reference)
            }
        }
    }
}
