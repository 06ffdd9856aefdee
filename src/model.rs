use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate, NaiveTime, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Used for claim expiry only; the booking calendar itself
/// is timezone-naive wall-clock.
pub type Ms = i64;

/// Minutes since local midnight, `0..=1440`.
pub type Minute = u16;

pub const MINUTES_PER_DAY: Minute = 24 * 60;

/// Half-open wall-clock interval `[start, end)` within one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Span {
    pub start: Minute,
    pub end: Minute,
}

impl Span {
    pub fn new(start: Minute, end: Minute) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Build `[start, start + minutes)` if it fits inside the day.
    pub fn starting_at(start: Minute, minutes: Minute) -> Option<Self> {
        let end = start.checked_add(minutes)?;
        (minutes > 0 && end <= MINUTES_PER_DAY).then(|| Self::new(start, end))
    }

    pub fn minutes(&self) -> Minute {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", format_clock(self.start), format_clock(self.end))
    }
}

// ── Date / clock helpers ─────────────────────────────────────────

/// Parse `HH:MM` (24-hour). `24:00` is accepted as end of day.
pub fn parse_clock(s: &str) -> Option<Minute> {
    let s = s.trim();
    if s == "24:00" {
        return Some(MINUTES_PER_DAY);
    }
    let t = NaiveTime::parse_from_str(s, "%H:%M").ok()?;
    Some((t.hour() * 60 + t.minute()) as Minute)
}

pub fn format_clock(m: Minute) -> String {
    format!("{:02}:{:02}", m / 60, m % 60)
}

/// Parse `YYYY-MM-DD`.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

pub fn format_date(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

/// Parse `HH:MM-HH:MM`.
pub fn parse_span(s: &str) -> Option<Span> {
    let (a, b) = s.split_once('-')?;
    let (start, end) = (parse_clock(a)?, parse_clock(b)?);
    (start < end).then(|| Span::new(start, end))
}

// ── Services ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceKind {
    Advisory,
    Wakala,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Advisory => "advisory",
            ServiceKind::Wakala => "wakala",
        }
    }

    pub fn reference_prefix(&self) -> &'static str {
        match self {
            ServiceKind::Advisory => "ADV",
            ServiceKind::Wakala => "WKL",
        }
    }
}

impl FromStr for ServiceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "advisory" => Ok(ServiceKind::Advisory),
            "wakala" => Ok(ServiceKind::Wakala),
            other => Err(format!("unknown service kind: {other}")),
        }
    }
}

/// A bookable offering. Maintained by provisioning, read-only during a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub kind: ServiceKind,
    pub name_en: String,
    pub name_ar: String,
    pub active: bool,
    /// Supported duration classes in minutes, ascending and deduplicated.
    pub durations: Vec<Minute>,
    pub requires_payment: bool,
}

impl Service {
    pub fn supports(&self, duration: Minute) -> bool {
        self.durations.contains(&duration)
    }

    pub fn offers_multiple_durations(&self) -> bool {
        self.durations.len() > 1
    }

    pub fn shortest_duration(&self) -> Option<Minute> {
        self.durations.first().copied()
    }
}

// ── Working hours ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingHours {
    pub open: Minute,
    pub close: Minute,
    pub active: bool,
    /// Sorted by start, non-overlapping, inside `[open, close)`.
    pub breaks: Vec<Span>,
}

impl WorkingHours {
    pub fn new(open: Minute, close: Minute, mut breaks: Vec<Span>) -> Self {
        breaks.sort_by_key(|b| b.start);
        Self {
            open,
            close,
            active: true,
            breaks,
        }
    }

    pub fn closed() -> Self {
        Self {
            open: 0,
            close: 0,
            active: false,
            breaks: Vec::new(),
        }
    }

    /// The open window, or `None` when the profile is inactive or empty.
    pub fn window(&self) -> Option<Span> {
        (self.active && self.open < self.close).then(|| Span::new(self.open, self.close))
    }

    /// True if `span` is inside the open window and clear of every break.
    pub fn admits(&self, span: &Span) -> bool {
        match self.window() {
            Some(window) => {
                window.contains_span(span) && !self.breaks.iter().any(|b| b.overlaps(span))
            }
            None => false,
        }
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if !self.active {
            return Ok(());
        }
        if self.open >= self.close {
            return Err("open must be before close");
        }
        if self.close > MINUTES_PER_DAY {
            return Err("close past end of day");
        }
        let window = Span::new(self.open, self.close);
        let mut prev_end: Option<Minute> = None;
        for b in &self.breaks {
            if b.start >= b.end {
                return Err("empty break");
            }
            if !window.contains_span(b) {
                return Err("break outside working hours");
            }
            if prev_end.is_some_and(|end| b.start < end) {
                return Err("overlapping breaks");
            }
            prev_end = Some(b.end);
        }
        Ok(())
    }
}

/// Association-wide opening calendar: weekly defaults, date overrides, blocked dates.
#[derive(Debug, Clone, Default)]
pub struct Calendar {
    /// Indexed by `Weekday::num_days_from_monday()`.
    pub weekly: [Option<WorkingHours>; 7],
    pub overrides: BTreeMap<NaiveDate, WorkingHours>,
    pub blocked: BTreeSet<NaiveDate>,
}

impl Calendar {
    /// Effective profile for `date`: an override replaces the weekly default,
    /// even when the override itself is inactive.
    pub fn profile(&self, date: NaiveDate) -> Option<&WorkingHours> {
        match self.overrides.get(&date) {
            Some(hours) => Some(hours),
            None => self.weekly[date.weekday().num_days_from_monday() as usize].as_ref(),
        }
    }

    /// Effective profile for `date`, only if it is active.
    pub fn effective(&self, date: NaiveDate) -> Option<&WorkingHours> {
        self.profile(date).filter(|h| h.window().is_some())
    }

    pub fn is_blocked(&self, date: NaiveDate) -> bool {
        self.blocked.contains(&date)
    }
}

pub fn weekday_index(day: Weekday) -> u8 {
    day.num_days_from_monday() as u8
}

// ── Availability units and computed slots ────────────────────────

/// Smallest schedulable granule for a (service, date).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityUnit {
    pub id: Ulid,
    pub service_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
    pub is_available: bool,
    /// Reservation currently holding this unit.
    pub held_by: Option<Ulid>,
}

impl AvailabilityUnit {
    /// Free, or held by `own` (a caller inspecting its own in-flight claim).
    pub fn is_free_for(&self, own: Option<Ulid>) -> bool {
        self.is_available || (own.is_some() && self.held_by == own)
    }
}

/// Duration-aware read-only view over contiguous units. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputedSlot {
    /// Id of the first constituent unit.
    pub id: Ulid,
    pub span: Span,
    #[serde(rename = "isAvailable")]
    pub is_available: bool,
}

impl ComputedSlot {
    pub fn start_clock(&self) -> String {
        format_clock(self.span.start)
    }

    pub fn end_clock(&self) -> String {
        format_clock(self.span.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnavailableReason {
    FullyBooked,
    Blocked,
}

impl UnavailableReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnavailableReason::FullyBooked => "fully_booked",
            UnavailableReason::Blocked => "blocked",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateAvailability {
    pub date: NaiveDate,
    pub reason: UnavailableReason,
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationRequest {
    /// Client-generated; repeating a request with the same id is idempotent.
    pub id: Ulid,
    pub slot_id: Ulid,
    pub service_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
    pub duration: Minute,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    /// Slot taken; the domain record has not been written yet.
    Claimed { expires_at: Ms },
    /// Paired with its domain record.
    Finalized { reference: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub slot_id: Ulid,
    pub service_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
    pub duration: Minute,
    pub unit_ids: Vec<Ulid>,
    pub status: ReservationStatus,
}

impl Reservation {
    pub fn reference(&self) -> Option<&str> {
        match &self.status {
            ReservationStatus::Finalized { reference } => Some(reference),
            ReservationStatus::Claimed { .. } => None,
        }
    }

    pub fn is_finalized(&self) -> bool {
        matches!(self.status, ReservationStatus::Finalized { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved(Reservation),
    /// Another party holds at least one constituent unit. Nothing was mutated.
    Conflict,
}

impl ReserveOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ReserveOutcome::Reserved(_))
    }
}

/// Push notification for one unit's availability flip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotChange {
    #[serde(rename = "slotId")]
    pub slot_id: Ulid,
    #[serde(rename = "serviceId")]
    pub service_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
    #[serde(rename = "isAvailable")]
    pub is_available: bool,
}

/// WAL record format. Flat, one variant per mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ServiceCreated {
        id: Ulid,
        kind: ServiceKind,
        name_en: String,
        name_ar: String,
        durations: Vec<Minute>,
        requires_payment: bool,
    },
    ServiceActiveSet {
        id: Ulid,
        active: bool,
    },
    WeeklyHoursSet {
        weekday: u8,
        hours: Option<WorkingHours>,
    },
    DateHoursSet {
        date: NaiveDate,
        hours: Option<WorkingHours>,
    },
    DateBlocked {
        date: NaiveDate,
    },
    DateUnblocked {
        date: NaiveDate,
    },
    UnitsPublished {
        service_id: Ulid,
        date: NaiveDate,
        units: Vec<(Ulid, Span)>,
    },
    ReservationClaimed {
        id: Ulid,
        slot_id: Ulid,
        service_id: Ulid,
        date: NaiveDate,
        span: Span,
        duration: Minute,
        unit_ids: Vec<Ulid>,
        expires_at: Ms,
    },
    ReservationFinalized {
        id: Ulid,
        service_id: Ulid,
        reference: String,
    },
    ReservationReleased {
        id: Ulid,
        service_id: Ulid,
    },
    /// A live claim's expiry pushed out (payment still in progress).
    ClaimExtended {
        id: Ulid,
        service_id: Ulid,
        expires_at: Ms,
    },
}
