use crate::{Backend, BackendSnapshot, ChangeFn, Command, Source};
use nowplaying_core::{CancelHandle, Listeners, PlaybackState, SourceApp, SourceId, Track};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Adapts a [`Backend`] to [`Source`].
///
/// A dedicated task owns the backend: it polls on a fixed interval, runs
/// commands in arrival order and re-polls right after each one. Subscribers
/// hear about every snapshot that differs from the previous one. Dropping the
/// source stops the task.
pub struct PolledSource {
    id: SourceId,
    app: SourceApp,
    cached: Arc<Mutex<BackendSnapshot>>,
    listeners: Listeners<ChangeFn>,
    commands: mpsc::UnboundedSender<Command>,
    worker: JoinHandle<()>,
}

impl PolledSource {
    pub fn spawn<B>(id: SourceId, backend: B, interval: Duration) -> Arc<Self>
    where
        B: Backend + 'static,
    {
        let app = backend.app();
        let cached = Arc::new(Mutex::new(BackendSnapshot::not_running()));
        let listeners: Listeners<ChangeFn> = Listeners::new();
        let (commands, command_rx) = mpsc::unbounded_channel();

        let worker = tokio::spawn(run_worker(
            id.clone(),
            backend,
            interval,
            Arc::clone(&cached),
            listeners.clone(),
            command_rx,
        ));

        Arc::new(Self {
            id,
            app,
            cached,
            listeners,
            commands,
            worker,
        })
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!(source = %self.id, ?command, "worker gone; command dropped");
        }
    }
}

async fn run_worker<B: Backend>(
    id: SourceId,
    mut backend: B,
    interval: Duration,
    cached: Arc<Mutex<BackendSnapshot>>,
    listeners: Listeners<ChangeFn>,
    mut command_rx: mpsc::UnboundedReceiver<Command>,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            command = command_rx.recv() => match command {
                Some(command) => {
                    if let Err(err) = backend.command(command).await {
                        warn!(source = %id, backend = backend.name(), ?command, error = %err, "command failed");
                    }
                }
                None => break,
            },
        }

        let snapshot = match backend.poll().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                debug!(source = %id, backend = backend.name(), error = %err, "poll failed; reporting not alive");
                BackendSnapshot::with_error(err)
            }
        };

        let changed = {
            let mut slot = lock(&cached);
            let changed = !slot.same_as(&snapshot);
            *slot = snapshot.clone();
            changed
        };

        if changed {
            for listener in listeners.snapshot() {
                listener(snapshot.track.clone(), snapshot.state);
            }
        }
    }
}

impl Drop for PolledSource {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

impl Source for PolledSource {
    fn id(&self) -> SourceId {
        self.id.clone()
    }

    fn app(&self) -> SourceApp {
        self.app
    }

    fn current_track(&self) -> Option<Track> {
        lock(&self.cached).track.clone()
    }

    fn current_state(&self) -> PlaybackState {
        lock(&self.cached).state
    }

    fn is_alive(&self) -> bool {
        lock(&self.cached).alive
    }

    fn supports_push(&self) -> bool {
        false
    }

    fn last_error(&self) -> Option<String> {
        lock(&self.cached).last_error.clone()
    }

    fn subscribe(&self, on_change: Arc<ChangeFn>) -> CancelHandle {
        self.listeners.add(on_change)
    }

    fn resume(&self) {
        self.send(Command::Resume);
    }

    fn pause(&self) {
        self.send(Command::Pause);
    }

    fn play_pause(&self) {
        self.send(Command::PlayPause);
    }

    fn skip_next(&self) {
        self.send(Command::SkipNext);
    }

    fn skip_previous(&self) {
        self.send(Command::SkipPrevious);
    }

    fn seek(&self, position: Duration) {
        self.send(Command::Seek(position));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::PolledSource;
    use crate::{Backend, BackendSnapshot, ChangeFn, Command, Source};
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use nowplaying_core::{PlaybackState, SourceApp, SourceId, Track};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct Script {
        snapshots: Vec<Result<BackendSnapshot, String>>,
        commands: Vec<Command>,
    }

    struct ScriptedBackend {
        script: Arc<Mutex<Script>>,
    }

    #[async_trait]
    impl Backend for ScriptedBackend {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn app(&self) -> SourceApp {
            SourceApp::Unknown
        }

        async fn poll(&mut self) -> Result<BackendSnapshot> {
            let mut script = self.script.lock().unwrap();
            let next = if script.snapshots.len() > 1 {
                script.snapshots.remove(0)
            } else {
                script.snapshots[0].clone()
            };
            next.map_err(|e| anyhow!(e))
        }

        async fn command(&mut self, command: Command) -> Result<()> {
            self.script.lock().unwrap().commands.push(command);
            Ok(())
        }
    }

    fn paused(id: &str) -> BackendSnapshot {
        BackendSnapshot::active(Some(Track::new(id)), PlaybackState::Paused { elapsed: Duration::from_secs(5) })
    }

    #[tokio::test(start_paused = true)]
    async fn caches_polls_and_notifies_only_on_change() {
        let script = Arc::new(Mutex::new(Script {
            snapshots: vec![Ok(paused("a")), Ok(paused("a")), Ok(paused("b"))],
            ..Script::default()
        }));
        let source = PolledSource::spawn(
            SourceId::new("scripted"),
            ScriptedBackend { script: Arc::clone(&script) },
            Duration::from_secs(1),
        );
        assert!(!source.is_alive());

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let callback: Arc<ChangeFn> = Arc::new(move |_: Option<Track>, _: PlaybackState| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let _sub = source.subscribe(callback);

        tokio::time::sleep(Duration::from_millis(2_500)).await;

        assert!(source.is_alive());
        assert_eq!(source.current_track().map(|t| t.id), Some("b".to_string()));
        // first poll (a), repeated a is silent, then b
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_errors_read_as_not_alive() {
        let script = Arc::new(Mutex::new(Script {
            snapshots: vec![Err("player vanished".to_string())],
            ..Script::default()
        }));
        let source = PolledSource::spawn(
            SourceId::new("scripted"),
            ScriptedBackend { script },
            Duration::from_secs(1),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!source.is_alive());
        assert_eq!(source.current_state(), PlaybackState::Stopped);
        assert_eq!(source.last_error().as_deref(), Some("player vanished"));
    }

    #[tokio::test(start_paused = true)]
    async fn commands_reach_the_backend_in_order() {
        let script = Arc::new(Mutex::new(Script {
            snapshots: vec![Ok(paused("a"))],
            ..Script::default()
        }));
        let source = PolledSource::spawn(
            SourceId::new("scripted"),
            ScriptedBackend { script: Arc::clone(&script) },
            Duration::from_secs(60),
        );

        source.resume();
        source.seek(Duration::from_secs(30));
        source.play_pause();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(
            script.lock().unwrap().commands,
            vec![Command::Resume, Command::Seek(Duration::from_secs(30)), Command::PlayPause]
        );
    }
}
