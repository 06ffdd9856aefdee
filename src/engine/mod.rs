mod catalog;
mod error;
mod horizon;
mod nearest;
mod provision;
mod queries;
mod reservation;

pub use catalog::{compute_slots, covering_run};
pub use error::EngineError;
pub use horizon::DayStatus;
pub use nearest::nearest_slot;

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{NaiveDate, Timelike};
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock, RwLockReadGuard};
use ulid::Ulid;

use crate::config::EngineConfig;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedServiceState = Arc<RwLock<ServiceState>>;

/// Everything one service owns: its units per date and its reservations.
#[derive(Debug, Clone)]
pub struct ServiceState {
    pub service: Service,
    /// Units per date, sorted by `span.start`.
    pub days: BTreeMap<NaiveDate, Vec<AvailabilityUnit>>,
    pub reservations: HashMap<Ulid, Reservation>,
}

impl ServiceState {
    pub fn new(service: Service) -> Self {
        Self {
            service,
            days: BTreeMap::new(),
            reservations: HashMap::new(),
        }
    }

    pub fn units(&self, date: NaiveDate) -> &[AvailabilityUnit] {
        self.days.get(&date).map_or(&[], |u| u.as_slice())
    }

    /// Index of the unit starting exactly at `start`.
    pub fn unit_position(&self, date: NaiveDate, start: Minute) -> Option<usize> {
        self.units(date)
            .binary_search_by_key(&start, |u| u.span.start)
            .ok()
    }

    fn insert_unit(&mut self, unit: AvailabilityUnit) {
        let units = self.days.entry(unit.date).or_default();
        let pos = units
            .binary_search_by_key(&unit.span.start, |u| u.span.start)
            .unwrap_or_else(|e| e);
        units.insert(pos, unit);
    }

    /// Flip the given units, returning one change per unit that actually flipped.
    fn set_units(
        &mut self,
        date: NaiveDate,
        unit_ids: &[Ulid],
        held_by: Option<Ulid>,
    ) -> Vec<SlotChange> {
        let service_id = self.service.id;
        let mut changes = Vec::new();
        let Some(units) = self.days.get_mut(&date) else {
            return changes;
        };
        for unit in units.iter_mut().filter(|u| unit_ids.contains(&u.id)) {
            let available = held_by.is_none();
            if unit.is_available != available {
                changes.push(SlotChange {
                    slot_id: unit.id,
                    service_id,
                    date,
                    span: unit.span,
                    is_available: available,
                });
            }
            unit.is_available = available;
            unit.held_by = held_by;
        }
        changes
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit:
/// block for the first append, drain whatever else is queued, fsync once,
/// then answer every sender in the batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so a partial batch never leaks into the next one.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

// ── Clock ────────────────────────────────────────────────

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Wall-clock "now" at the service location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalNow {
    pub today: NaiveDate,
    pub minute: Minute,
}

impl LocalNow {
    pub fn current() -> Self {
        let now = chrono::Local::now().naive_local();
        Self {
            today: now.date(),
            minute: (now.hour() * 60 + now.minute()) as Minute,
        }
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    pub services: DashMap<Ulid, SharedServiceState>,
    pub calendar: RwLock<Calendar>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub config: EngineConfig,
    /// Unit id → (service id, date).
    pub(super) unit_index: DashMap<Ulid, (Ulid, NaiveDate)>,
    /// Reservation id → service id.
    pub(super) reservation_index: DashMap<Ulid, Ulid>,
    /// Booking reference → reservation id.
    pub(super) references: DashMap<String, Ulid>,
    /// Shared by every mutation from before its first state lock until it is
    /// applied; exclusive for `compact_wal` from snapshot to swap. An append
    /// therefore lands either in the snapshot or in the new log, never in the
    /// file being replaced.
    compaction: RwLock<()>,
}

struct Indexes<'a> {
    units: &'a DashMap<Ulid, (Ulid, NaiveDate)>,
    reservations: &'a DashMap<Ulid, Ulid>,
    references: &'a DashMap<String, Ulid>,
}

/// Apply a service-scoped event. Caller holds the write lock.
/// Returns the unit flips to broadcast.
fn apply_to_service(rs: &mut ServiceState, event: &Event, idx: &Indexes<'_>) -> Vec<SlotChange> {
    match event {
        Event::ServiceActiveSet { active, .. } => {
            rs.service.active = *active;
            Vec::new()
        }
        Event::UnitsPublished {
            service_id,
            date,
            units,
        } => {
            let mut changes = Vec::with_capacity(units.len());
            for (id, span) in units {
                rs.insert_unit(AvailabilityUnit {
                    id: *id,
                    service_id: *service_id,
                    date: *date,
                    span: *span,
                    is_available: true,
                    held_by: None,
                });
                idx.units.insert(*id, (*service_id, *date));
                changes.push(SlotChange {
                    slot_id: *id,
                    service_id: *service_id,
                    date: *date,
                    span: *span,
                    is_available: true,
                });
            }
            changes
        }
        Event::ReservationClaimed {
            id,
            slot_id,
            service_id,
            date,
            span,
            duration,
            unit_ids,
            expires_at,
        } => {
            let changes = rs.set_units(*date, unit_ids, Some(*id));
            rs.reservations.insert(
                *id,
                Reservation {
                    id: *id,
                    slot_id: *slot_id,
                    service_id: *service_id,
                    date: *date,
                    span: *span,
                    duration: *duration,
                    unit_ids: unit_ids.clone(),
                    status: ReservationStatus::Claimed {
                        expires_at: *expires_at,
                    },
                },
            );
            idx.reservations.insert(*id, *service_id);
            changes
        }
        Event::ReservationFinalized { id, reference, .. } => {
            if let Some(r) = rs.reservations.get_mut(id) {
                r.status = ReservationStatus::Finalized {
                    reference: reference.clone(),
                };
                idx.references.insert(reference.clone(), *id);
            }
            Vec::new()
        }
        Event::ClaimExtended { id, expires_at, .. } => {
            if let Some(r) = rs.reservations.get_mut(id)
                && let ReservationStatus::Claimed { expires_at: current } = &mut r.status
            {
                *current = *expires_at;
            }
            Vec::new()
        }
        Event::ReservationReleased { id, .. } => {
            let Some(r) = rs.reservations.remove(id) else {
                return Vec::new();
            };
            idx.reservations.remove(id);
            if let Some(reference) = r.reference() {
                idx.references.remove(reference);
            }
            rs.set_units(r.date, &r.unit_ids, None)
        }
        // Service creation and calendar events are applied outside a service lock.
        Event::ServiceCreated { .. }
        | Event::WeeklyHoursSet { .. }
        | Event::DateHoursSet { .. }
        | Event::DateBlocked { .. }
        | Event::DateUnblocked { .. } => Vec::new(),
    }
}

fn apply_to_calendar(cal: &mut Calendar, event: &Event) {
    match event {
        Event::WeeklyHoursSet { weekday, hours } => {
            if let Some(slot) = cal.weekly.get_mut(*weekday as usize) {
                *slot = hours.clone();
            }
        }
        Event::DateHoursSet { date, hours } => match hours {
            Some(h) => {
                cal.overrides.insert(*date, h.clone());
            }
            None => {
                cal.overrides.remove(date);
            }
        },
        Event::DateBlocked { date } => {
            cal.blocked.insert(*date);
        }
        Event::DateUnblocked { date } => {
            cal.blocked.remove(date);
        }
        _ => {}
    }
}

fn service_from_event(event: &Event) -> Option<Service> {
    match event {
        Event::ServiceCreated {
            id,
            kind,
            name_en,
            name_ar,
            durations,
            requires_payment,
        } => Some(Service {
            id: *id,
            kind: *kind,
            name_en: name_en.clone(),
            name_ar: name_ar.clone(),
            active: true,
            durations: durations.clone(),
            requires_payment: *requires_payment,
        }),
        _ => None,
    }
}

/// Service an event belongs to (for service-scoped events).
fn event_service_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ServiceActiveSet { id, .. } => Some(*id),
        Event::UnitsPublished { service_id, .. }
        | Event::ReservationClaimed { service_id, .. }
        | Event::ReservationFinalized { service_id, .. }
        | Event::ReservationReleased { service_id, .. }
        | Event::ClaimExtended { service_id, .. } => Some(*service_id),
        _ => None,
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        config: EngineConfig,
    ) -> std::io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            services: DashMap::new(),
            calendar: RwLock::new(Calendar::default()),
            wal_tx,
            notify,
            config,
            unit_index: DashMap::new(),
            reservation_index: DashMap::new(),
            references: DashMap::new(),
            compaction: RwLock::new(()),
        };

        // Sole owner of every lock during replay: try_write always succeeds.
        // blocking_write would panic here since this may run inside a runtime.
        for event in &events {
            engine.replay_event(event);
        }
        tracing::info!(
            "replayed {} events: {} services",
            events.len(),
            engine.services.len()
        );

        Ok(engine)
    }

    fn replay_event(&self, event: &Event) {
        if let Some(service) = service_from_event(event) {
            self.services
                .insert(service.id, Arc::new(RwLock::new(ServiceState::new(service))));
            return;
        }
        if let Some(service_id) = event_service_id(event) {
            if let Some(rs) = self.get_service(&service_id) {
                let mut guard = rs.try_write().expect("replay: uncontended write");
                apply_to_service(&mut guard, event, &self.indexes());
            }
            return;
        }
        let mut cal = self.calendar.try_write().expect("replay: uncontended write");
        apply_to_calendar(&mut cal, event);
    }

    fn indexes(&self) -> Indexes<'_> {
        Indexes {
            units: &self.unit_index,
            reservations: &self.reservation_index,
            references: &self.references,
        }
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Taken before any service or calendar lock. Never nest two.
    pub(super) async fn write_gate(&self) -> RwLockReadGuard<'_, ()> {
        self.compaction.read().await
    }

    pub fn get_service(&self, id: &Ulid) -> Option<SharedServiceState> {
        self.services.get(id).map(|e| e.value().clone())
    }

    /// WAL-append + apply + notify for a service-scoped event. Caller holds
    /// the write gate.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut ServiceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        for change in apply_to_service(rs, event, &self.indexes()) {
            self.notify.send(change);
        }
        Ok(())
    }

    /// WAL-append + apply for a calendar event.
    pub(super) async fn persist_calendar(&self, event: &Event) -> Result<(), EngineError> {
        let _gate = self.write_gate().await;
        let mut cal = self.calendar.write().await;
        self.wal_append(event).await?;
        apply_to_calendar(&mut cal, event);
        Ok(())
    }

    /// Rewrite the WAL with only the events needed to recreate current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.compaction.write().await;
        let mut events = Vec::new();
        {
            let cal = self.calendar.read().await;
            for (weekday, hours) in cal.weekly.iter().enumerate() {
                if hours.is_some() {
                    events.push(Event::WeeklyHoursSet {
                        weekday: weekday as u8,
                        hours: hours.clone(),
                    });
                }
            }
            for (date, hours) in &cal.overrides {
                events.push(Event::DateHoursSet {
                    date: *date,
                    hours: Some(hours.clone()),
                });
            }
            for date in &cal.blocked {
                events.push(Event::DateBlocked { date: *date });
            }
        }

        let shared: Vec<SharedServiceState> =
            self.services.iter().map(|e| e.value().clone()).collect();
        for rs in shared {
            let guard = rs.read().await;
            let s = &guard.service;
            events.push(Event::ServiceCreated {
                id: s.id,
                kind: s.kind,
                name_en: s.name_en.clone(),
                name_ar: s.name_ar.clone(),
                durations: s.durations.clone(),
                requires_payment: s.requires_payment,
            });
            if !s.active {
                events.push(Event::ServiceActiveSet {
                    id: s.id,
                    active: false,
                });
            }
            for (date, units) in &guard.days {
                events.push(Event::UnitsPublished {
                    service_id: s.id,
                    date: *date,
                    units: units.iter().map(|u| (u.id, u.span)).collect(),
                });
            }
            for r in guard.reservations.values() {
                let expires_at = match &r.status {
                    ReservationStatus::Claimed { expires_at } => *expires_at,
                    ReservationStatus::Finalized { .. } => 0,
                };
                events.push(Event::ReservationClaimed {
                    id: r.id,
                    slot_id: r.slot_id,
                    service_id: r.service_id,
                    date: r.date,
                    span: r.span,
                    duration: r.duration,
                    unit_ids: r.unit_ids.clone(),
                    expires_at,
                });
                if let Some(reference) = r.reference() {
                    events.push(Event::ReservationFinalized {
                        id: r.id,
                        service_id: r.service_id,
                        reference: reference.to_string(),
                    });
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
