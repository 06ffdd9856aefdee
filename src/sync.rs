use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, NaiveDate};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::backend::SlotBackend;
use crate::engine::EngineError;
use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    /// Full recompute cadence, the backstop for missed pushes.
    pub poll_interval: Duration,
    /// How long a just-taken slot stays flagged as recently booked.
    pub recent_window: Duration,
    /// Days from today covered by the date-availability horizon.
    pub horizon_days: u32,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            recent_window: Duration::from_secs(3),
            horizon_days: 60,
        }
    }
}

/// The (service, date, duration) a client is looking at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewKey {
    pub service_id: Ulid,
    pub date: NaiveDate,
    pub duration: Minute,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncWarning {
    /// The selected slot was taken by someone else and has been deselected.
    SelectionLost { slot_id: Ulid, span: Span },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Subscribed(ViewKey),
    TornDown,
}

/// What the client renders. Replaced wholesale on every change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SlotView {
    pub key: Option<ViewKey>,
    pub slots: Vec<ComputedSlot>,
    /// Slots removed by a push within the recent window.
    pub recently_booked: Vec<Ulid>,
    pub selected: Option<Ulid>,
    pub warning: Option<SyncWarning>,
    pub unavailable_dates: Vec<DateAvailability>,
    /// Bumped on every accepted full refresh. Zero until the first one lands.
    pub generation: u64,
    /// Last failed refresh; the slot list above is the last good one.
    pub last_error: Option<String>,
}

impl SlotView {
    pub fn is_loaded(&self) -> bool {
        self.generation > 0
    }

    pub fn selected_slot(&self) -> Option<&ComputedSlot> {
        let id = self.selected?;
        self.slots.iter().find(|s| s.id == id)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("no view is being watched")]
    NotWatching,
    #[error("slot {0} is not in the current list")]
    SlotNotListed(Ulid),
    #[error("sync task stopped")]
    Stopped,
}

enum SyncCommand {
    Select {
        slot_id: Ulid,
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    ClearSelection,
    Refresh,
}

/// Keeps one (service, date, duration) slot list current from push events
/// and periodic full recomputes. At most one view is watched at a time;
/// watching a new key tears the previous channels down first.
pub struct LiveSync<B: SlotBackend> {
    backend: Arc<B>,
    options: SyncOptions,
    phase: SyncPhase,
    view_rx: watch::Receiver<SlotView>,
    commands: Option<mpsc::Sender<SyncCommand>>,
    cancel: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

impl<B: SlotBackend> LiveSync<B> {
    pub fn new(backend: Arc<B>, options: SyncOptions) -> Self {
        let (_, view_rx) = watch::channel(SlotView::default());
        Self {
            backend,
            options,
            phase: SyncPhase::Idle,
            view_rx,
            commands: None,
            cancel: None,
            handle: None,
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    /// Start (or switch) watching `key`. Always begins with a full recompute.
    pub async fn watch(&mut self, key: ViewKey) {
        if self.phase == SyncPhase::Subscribed(key) {
            return;
        }
        self.teardown().await;

        let initial = SlotView {
            key: Some(key),
            ..SlotView::default()
        };
        let (view_tx, view_rx) = watch::channel(initial);
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();
        let push = self.backend.subscribe(key.service_id);

        let actor = SyncActor {
            backend: self.backend.clone(),
            key,
            options: self.options.clone(),
            view_tx,
            recent: HashMap::new(),
            pushes_seen: 0,
            in_flight: false,
            rerun: false,
        };
        self.handle = Some(tokio::spawn(actor.run(cancel.clone(), cmd_rx, push)));
        self.view_rx = view_rx;
        self.commands = Some(cmd_tx);
        self.cancel = Some(cancel);
        self.phase = SyncPhase::Subscribed(key);
    }

    /// Stop both channels and wait for the background task to exit.
    pub async fn teardown(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        self.commands = None;
        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
        {
            warn!("live sync task ended abnormally: {e}");
        }
        if self.phase != SyncPhase::Idle {
            self.phase = SyncPhase::TornDown;
        }
    }

    pub fn view(&self) -> SlotView {
        self.view_rx.borrow().clone()
    }

    /// Receiver that wakes on every view change of the current key.
    pub fn subscribe_view(&self) -> watch::Receiver<SlotView> {
        self.view_rx.clone()
    }

    /// Select a slot that is in the current list.
    pub async fn select(&self, slot_id: Ulid) -> Result<(), SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(SyncCommand::Select { slot_id, reply }).await?;
        rx.await.map_err(|_| SyncError::Stopped)?
    }

    pub async fn clear_selection(&self) -> Result<(), SyncError> {
        self.send(SyncCommand::ClearSelection).await
    }

    /// Ask for an immediate full recompute.
    pub async fn refresh(&self) -> Result<(), SyncError> {
        self.send(SyncCommand::Refresh).await
    }

    async fn send(&self, cmd: SyncCommand) -> Result<(), SyncError> {
        let tx = self.commands.as_ref().ok_or(SyncError::NotWatching)?;
        tx.send(cmd).await.map_err(|_| SyncError::Stopped)
    }
}

impl<B: SlotBackend> Drop for LiveSync<B> {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

type RefreshResult = Result<(Vec<ComputedSlot>, Vec<DateAvailability>), EngineError>;

struct SyncActor<B: SlotBackend> {
    backend: Arc<B>,
    key: ViewKey,
    options: SyncOptions,
    view_tx: watch::Sender<SlotView>,
    /// Slot id → when a push removed it.
    recent: HashMap<Ulid, Instant>,
    /// Pushes for the viewed date so far; a refresh issued before the
    /// latest push is stale on arrival.
    pushes_seen: u64,
    in_flight: bool,
    rerun: bool,
}

impl<B: SlotBackend> SyncActor<B> {
    async fn run(
        mut self,
        cancel: CancellationToken,
        mut commands: mpsc::Receiver<SyncCommand>,
        push: broadcast::Receiver<SlotChange>,
    ) {
        let mut push = Some(push);
        let mut refreshes: JoinSet<(u64, RefreshResult)> = JoinSet::new();
        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.options.poll_interval,
            self.options.poll_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.request_refresh(&mut refreshes);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(cmd) = commands.recv() => self.on_command(cmd, &mut refreshes),
                change = next_push(&mut push) => match change {
                    Ok(change) => self.on_push(change, &mut refreshes),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("live sync lagged by {n} events, refreshing");
                        self.request_refresh(&mut refreshes);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("push channel closed for {}, polling only", self.key.service_id);
                        push = None;
                    }
                },
                Some(joined) = refreshes.join_next() => {
                    self.in_flight = false;
                    match joined {
                        Ok((issued_at, result)) => self.on_refresh(issued_at, result),
                        Err(e) => warn!("refresh task failed: {e}"),
                    }
                    if std::mem::take(&mut self.rerun) {
                        self.request_refresh(&mut refreshes);
                    }
                }
                _ = ticker.tick() => {
                    self.expire_recent();
                    self.request_refresh(&mut refreshes);
                }
            }
        }
        refreshes.abort_all();
    }

    /// Single-flight: a request while one is running only marks a rerun.
    fn request_refresh(&mut self, refreshes: &mut JoinSet<(u64, RefreshResult)>) {
        if self.in_flight {
            self.rerun = true;
            return;
        }
        self.in_flight = true;
        let backend = self.backend.clone();
        let key = self.key;
        let today = chrono::Local::now().date_naive();
        let last = today
            .checked_add_days(Days::new(u64::from(self.options.horizon_days)))
            .unwrap_or(today);
        let issued_at = self.pushes_seen;
        refreshes.spawn(async move {
            let result: RefreshResult = async {
                let slots = backend
                    .available_slots(key.service_id, key.date, key.duration)
                    .await?;
                let dates = backend.unavailable_dates(key.service_id, today, last).await?;
                Ok((slots, dates))
            }
            .await;
            (issued_at, result)
        });
    }

    fn on_refresh(&mut self, issued_at: u64, result: RefreshResult) {
        if issued_at != self.pushes_seen {
            debug!("discarding refresh overtaken by a push");
            self.rerun = true;
            return;
        }
        match result {
            Ok((slots, dates)) => self.view_tx.send_modify(|view| {
                let previous = view.selected_slot().map(|s| s.span);
                view.slots = slots;
                view.unavailable_dates = dates;
                view.generation += 1;
                view.last_error = None;
                if let Some(id) = view.selected
                    && !view.slots.iter().any(|s| s.id == id)
                {
                    view.selected = None;
                    view.warning =
                        previous.map(|span| SyncWarning::SelectionLost { slot_id: id, span });
                }
            }),
            Err(e) => {
                warn!("slot refresh failed: {e}");
                self.view_tx.send_modify(|view| view.last_error = Some(e.to_string()));
            }
        }
    }

    fn on_push(&mut self, change: SlotChange, refreshes: &mut JoinSet<(u64, RefreshResult)>) {
        if change.date != self.key.date {
            return;
        }
        self.pushes_seen += 1;
        if change.is_available {
            // Reappearing slots need working hours to rebuild; recompute.
            self.request_refresh(refreshes);
            return;
        }
        let now = Instant::now();
        let recent = &mut self.recent;
        self.view_tx.send_modify(|view| {
            let selected = view.selected;
            let mut lost = None;
            view.slots.retain(|slot| {
                if !slot.span.overlaps(&change.span) {
                    return true;
                }
                recent.insert(slot.id, now);
                if selected == Some(slot.id) {
                    lost = Some(SyncWarning::SelectionLost {
                        slot_id: slot.id,
                        span: slot.span,
                    });
                }
                false
            });
            if let Some(warning) = lost {
                view.selected = None;
                view.warning = Some(warning);
            }
            view.recently_booked = recent.keys().copied().collect();
        });
    }

    fn on_command(&mut self, cmd: SyncCommand, refreshes: &mut JoinSet<(u64, RefreshResult)>) {
        match cmd {
            SyncCommand::Select { slot_id, reply } => {
                let mut outcome = Ok(());
                self.view_tx.send_if_modified(|view| {
                    if view.slots.iter().any(|s| s.id == slot_id) {
                        view.selected = Some(slot_id);
                        view.warning = None;
                        true
                    } else {
                        outcome = Err(SyncError::SlotNotListed(slot_id));
                        false
                    }
                });
                let _ = reply.send(outcome);
            }
            SyncCommand::ClearSelection => self.view_tx.send_modify(|view| {
                view.selected = None;
                view.warning = None;
            }),
            SyncCommand::Refresh => self.request_refresh(refreshes),
        }
    }

    fn expire_recent(&mut self) {
        let window = self.options.recent_window;
        let before = self.recent.len();
        self.recent.retain(|_, at| at.elapsed() < window);
        if self.recent.len() != before {
            let ids: Vec<Ulid> = self.recent.keys().copied().collect();
            self.view_tx.send_modify(|view| view.recently_booked = ids);
        }
    }
}

/// Next push event, or never once the channel is gone.
async fn next_push(
    push: &mut Option<broadcast::Receiver<SlotChange>>,
) -> Result<SlotChange, broadcast::error::RecvError> {
    match push {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
