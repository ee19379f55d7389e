use crate::reconcile::{reconcile_update, DiffKind, SourceSnapshot};
use crate::scheduler::Scheduler;
use crate::selection::Candidate;
use crate::AggregatorConfig;
use nowplaying_core::{CancelHandle, Listeners, PlaybackState, SourceId, Track};
use nowplaying_sources::{ChangeFn, Command, Source};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NowPlaying {
    pub source: Option<SourceId>,
    pub track: Option<Track>,
    pub state: PlaybackState,
}

pub type ObserverFn = dyn Fn(&NowPlaying) + Send + Sync;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregatorError {
    #[error("aggregator has been stopped")]
    Stopped,
    #[error("source `{0}` is already registered")]
    DuplicateSource(SourceId),
    #[error("source `{0}` is not registered")]
    UnknownSource(SourceId),
    #[error("poll interval must be greater than zero")]
    ZeroInterval,
}

enum Event {
    Added(Arc<dyn Source>),
    Removed(SourceId),
    Changed {
        id: SourceId,
        generation: u64,
        track: Option<Track>,
        state: PlaybackState,
    },
    Tick { force: bool },
    Preferred(Option<SourceId>),
    Command(Command),
    PollInterval(Duration),
    Settle(oneshot::Sender<()>),
}

struct Shared {
    published: RwLock<NowPlaying>,
    observers: Listeners<ObserverFn>,
    members: Mutex<Vec<SourceId>>,
    stopped: AtomicBool,
}

struct Lifecycle {
    shutdown_tx: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

/// All state lives on one processing task; every other party only enqueues.
/// Observer callbacks run on that task.
pub struct Aggregator {
    events: mpsc::UnboundedSender<Event>,
    shared: Arc<Shared>,
    lifecycle: tokio::sync::Mutex<Option<Lifecycle>>,
}

impl Aggregator {
    pub fn new(config: AggregatorConfig, sources: Vec<Arc<dyn Source>>) -> Self {
        let (events, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            published: RwLock::new(NowPlaying::default()),
            observers: Listeners::new(),
            members: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        });

        let tick_tx = events.clone();
        let scheduler = Scheduler::spawn(config.fallback_poll_interval, move || {
            let _ = tick_tx.send(Event::Tick { force: false });
        });

        let core = Core {
            preferred: config.preferred_source.clone(),
            config,
            scheduler,
            events: events.clone(),
            shared: Arc::clone(&shared),
            entries: Vec::new(),
            selected: None,
            published: NowPlaying::default(),
            next_generation: 0,
        };
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let join = tokio::spawn(core.run(events_rx, shutdown_rx));

        let aggregator = Self {
            events,
            shared,
            lifecycle: tokio::sync::Mutex::new(Some(Lifecycle { shutdown_tx, join })),
        };
        for source in sources {
            if let Err(err) = aggregator.add_source(source) {
                warn!(error = %err, "skipping source");
            }
        }
        aggregator
    }

    pub fn subscribe<F>(&self, on_change: F) -> CancelHandle
    where
        F: Fn(&NowPlaying) + Send + Sync + 'static,
    {
        if self.is_stopped() {
            return CancelHandle::noop();
        }
        self.shared.observers.add(Arc::new(on_change))
    }

    pub fn now_playing(&self) -> NowPlaying {
        read(&self.shared.published).clone()
    }

    pub fn current_track(&self) -> Option<Track> {
        read(&self.shared.published).track.clone()
    }

    pub fn current_playback_state(&self) -> PlaybackState {
        read(&self.shared.published).state
    }

    pub fn current_source(&self) -> Option<SourceId> {
        read(&self.shared.published).source.clone()
    }

    pub fn source_ids(&self) -> Vec<SourceId> {
        lock(&self.shared.members).clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    pub fn add_source(&self, source: Arc<dyn Source>) -> Result<(), AggregatorError> {
        self.ensure_running()?;
        let id = source.id();
        let mut members = lock(&self.shared.members);
        if members.contains(&id) {
            return Err(AggregatorError::DuplicateSource(id));
        }
        // sent under the lock so membership and event order agree
        self.send(Event::Added(source))?;
        members.push(id);
        Ok(())
    }

    pub fn remove_source(&self, id: &SourceId) -> Result<(), AggregatorError> {
        self.ensure_running()?;
        let mut members = lock(&self.shared.members);
        let Some(index) = members.iter().position(|m| m == id) else {
            return Err(AggregatorError::UnknownSource(id.clone()));
        };
        self.send(Event::Removed(id.clone()))?;
        members.remove(index);
        Ok(())
    }

    pub fn set_preferred_source(&self, preferred: Option<SourceId>) -> Result<(), AggregatorError> {
        self.ensure_running()?;
        self.send(Event::Preferred(preferred))
    }

    pub fn set_fallback_poll_interval(&self, interval: Duration) -> Result<(), AggregatorError> {
        if interval.is_zero() {
            return Err(AggregatorError::ZeroInterval);
        }
        self.ensure_running()?;
        self.send(Event::PollInterval(interval))
    }

    pub fn resume(&self) {
        self.command(Command::Resume);
    }

    pub fn pause(&self) {
        self.command(Command::Pause);
    }

    pub fn play_pause(&self) {
        self.command(Command::PlayPause);
    }

    pub fn skip_next(&self) {
        self.command(Command::SkipNext);
    }

    pub fn skip_previous(&self) {
        self.command(Command::SkipPrevious);
    }

    pub fn seek(&self, position: Duration) {
        self.command(Command::Seek(position));
    }

    // no selection, or stopped: dropped
    pub fn command(&self, command: Command) {
        if self.events.send(Event::Command(command)).is_err() {
            debug!(?command, "aggregator stopped; command dropped");
        }
    }

    pub fn refresh(&self) -> Result<(), AggregatorError> {
        self.ensure_running()?;
        self.send(Event::Tick { force: true })
    }

    pub async fn settle(&self) {
        let (tx, rx) = oneshot::channel();
        if self.events.send(Event::Settle(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// No observer callback runs after this returns.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(Lifecycle { shutdown_tx, join }) = lifecycle.take() else {
            return;
        };
        self.shared.stopped.store(true, Ordering::SeqCst);
        let _ = shutdown_tx.send(());
        if let Err(err) = join.await {
            warn!(error = %err, "aggregator task ended abnormally");
        }
        debug!(observers = self.shared.observers.len(), "dropping observers");
        self.shared.observers.clear();
        lock(&self.shared.members).clear();
        *write(&self.shared.published) = NowPlaying::default();
        info!("aggregator stopped");
    }

    fn ensure_running(&self) -> Result<(), AggregatorError> {
        if self.is_stopped() {
            Err(AggregatorError::Stopped)
        } else {
            Ok(())
        }
    }

    fn send(&self, event: Event) -> Result<(), AggregatorError> {
        self.events.send(event).map_err(|_| AggregatorError::Stopped)
    }
}

struct Entry {
    id: SourceId,
    source: Arc<dyn Source>,
    generation: u64,
    push: bool,
    alive: bool,
    snapshot: SourceSnapshot,
    _subscription: CancelHandle,
}

struct Core {
    config: AggregatorConfig,
    scheduler: Scheduler,
    events: mpsc::UnboundedSender<Event>,
    shared: Arc<Shared>,
    entries: Vec<Entry>,
    selected: Option<SourceId>,
    preferred: Option<SourceId>,
    published: NowPlaying,
    next_generation: u64,
}

impl Core {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<Event>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                event = events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
            }
        }
        self.scheduler.cancel();
        self.entries.clear();
    }

    fn handle(&mut self, event: Event) {
        let now = SystemTime::now();
        match event {
            Event::Added(source) => self.on_added(source, now),
            Event::Removed(id) => self.on_removed(&id),
            Event::Changed {
                id,
                generation,
                track,
                state,
            } => {
                let Some(entry) = self
                    .entries
                    .iter_mut()
                    .find(|e| e.id == id && e.generation == generation)
                else {
                    debug!(source = %id, generation, "dropping event from a stale subscription");
                    return;
                };
                let alive = entry.source.is_alive();
                apply(entry, track, state, alive, &self.config, now);
            }
            Event::Tick { force } => {
                let poll_push = force || self.config.poll_push_sources;
                for entry in self.entries.iter_mut().filter(|e| poll_push || !e.push) {
                    let source = Arc::clone(&entry.source);
                    apply(
                        entry,
                        source.current_track(),
                        source.current_state(),
                        source.is_alive(),
                        &self.config,
                        now,
                    );
                }
            }
            Event::Preferred(preferred) => {
                debug!(preferred = ?preferred.as_ref().map(SourceId::as_str), "preferred source set");
                self.preferred = preferred;
            }
            Event::Command(command) => {
                self.forward(command);
                return;
            }
            Event::PollInterval(interval) => {
                let previous = self.scheduler.period();
                self.scheduler.set_period(interval);
                debug!(
                    from_ms = previous.as_millis() as u64,
                    to_ms = self.scheduler.period().as_millis() as u64,
                    "fallback poll interval changed"
                );
                return;
            }
            Event::Settle(done) => {
                let _ = done.send(());
                return;
            }
        }
        self.reselect();
    }

    fn on_added(&mut self, source: Arc<dyn Source>, now: SystemTime) {
        let id = source.id();
        if self.entries.iter().any(|e| e.id == id) {
            warn!(source = %id, "source already registered; ignoring");
            return;
        }
        let generation = self.next_generation;
        self.next_generation += 1;

        let events = self.events.clone();
        let callback_id = id.clone();
        let callback: Arc<ChangeFn> = Arc::new(move |track: Option<Track>, state: PlaybackState| {
            let _ = events.send(Event::Changed {
                id: callback_id.clone(),
                generation,
                track,
                state,
            });
        });
        let subscription = source.subscribe(callback);
        let push = source.supports_push();

        let mut entry = Entry {
            id: id.clone(),
            source: Arc::clone(&source),
            generation,
            push,
            alive: false,
            snapshot: SourceSnapshot::default(),
            _subscription: subscription,
        };
        apply(
            &mut entry,
            source.current_track(),
            source.current_state(),
            source.is_alive(),
            &self.config,
            now,
        );
        self.entries.push(entry);
        info!(source = %id, push, "source added");
    }

    fn on_removed(&mut self, id: &SourceId) {
        let Some(index) = self.entries.iter().position(|e| &e.id == id) else {
            warn!(source = %id, "removing unknown source");
            return;
        };
        // dropping the entry cancels its subscription
        self.entries.remove(index);
        if self.selected.as_ref() == Some(id) {
            self.selected = None;
        }
        info!(source = %id, "source removed");
    }

    fn reselect(&mut self) {
        let candidates: Vec<Candidate<'_>> = self
            .entries
            .iter()
            .map(|e| Candidate {
                id: &e.id,
                state: e.snapshot.state,
                alive: e.alive,
            })
            .collect();
        let selection =
            self.config
                .selection
                .select(&candidates, self.selected.as_ref(), self.preferred.as_ref());

        let next_selected = selection.as_ref().map(|s| s.id.clone());
        if next_selected != self.selected {
            info!(
                from = ?self.selected.as_ref().map(SourceId::as_str),
                to = ?next_selected.as_ref().map(SourceId::as_str),
                reason = ?selection.as_ref().map(|s| s.reason),
                "selected source changed"
            );
            self.selected = next_selected;
        }

        let next = match self.selected_entry() {
            Some(entry) => NowPlaying {
                source: Some(entry.id.clone()),
                track: entry.snapshot.track.clone(),
                state: entry.snapshot.state,
            },
            None => NowPlaying::default(),
        };

        // NowPlaying equality sees track ids only
        let material = next != self.published;
        let metadata_only = !material && !same_metadata(&next.track, &self.published.track);
        if !material && !metadata_only {
            return;
        }

        *write(&self.shared.published) = next.clone();
        self.published = next;
        if material {
            self.notify();
        }
    }

    fn notify(&self) {
        if self.shared.observers.is_empty() {
            return;
        }
        for observer in self.shared.observers.snapshot() {
            if self.shared.stopped.load(Ordering::SeqCst) {
                break;
            }
            observer(&self.published);
        }
    }

    fn selected_entry(&self) -> Option<&Entry> {
        let selected = self.selected.as_ref()?;
        self.entries.iter().find(|e| &e.id == selected)
    }

    fn forward(&self, command: Command) {
        let Some(entry) = self.selected_entry() else {
            debug!(?command, "no selected source; command dropped");
            return;
        };
        debug!(source = %entry.id, ?command, "forwarding command");
        match command {
            Command::PlayPause => {
                if self.published.state.is_playing() {
                    entry.source.pause();
                } else {
                    entry.source.resume();
                }
            }
            other => entry.source.execute(other),
        }
    }
}

fn apply(
    entry: &mut Entry,
    track: Option<Track>,
    state: PlaybackState,
    alive: bool,
    config: &AggregatorConfig,
    now: SystemTime,
) {
    let incoming = if alive {
        sanitize(&entry.id, track, state, now)
    } else {
        SourceSnapshot::default()
    };
    let tolerance = if entry.push {
        config.push_tolerance
    } else {
        config.reconcile_tolerance
    };

    let (diff, next) = reconcile_update(&entry.snapshot, incoming, tolerance, now);
    if entry.alive != alive {
        debug!(source = %entry.id, alive, "source liveness changed");
        entry.alive = alive;
    }
    if diff != DiffKind::Nothing {
        debug!(source = %entry.id, ?diff, state = next.state.label(), "source updated");
    }
    entry.snapshot = next;
}

fn sanitize(id: &SourceId, track: Option<Track>, state: PlaybackState, now: SystemTime) -> SourceSnapshot {
    let track = match track {
        Some(track) if !track.is_valid() => {
            warn!(source = %id, "ignoring track with an empty id");
            None
        }
        other => other,
    };
    if let PlaybackState::Playing { anchor } = state {
        if anchor > now {
            warn!(source = %id, "playing anchor lies in the future; clamping to now");
        }
    }
    SourceSnapshot::new(track, state.normalized(now))
}

fn same_metadata(a: &Option<Track>, b: &Option<Track>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.same_metadata(b),
        (None, None) => true,
        _ => false,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(rw: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    rw.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(rw: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    rw.write().unwrap_or_else(PoisonError::into_inner)
}
