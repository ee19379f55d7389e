use crate::{ChangeFn, Source};
use nowplaying_core::{CancelHandle, Listeners, PlaybackState, SourceApp, SourceId, Track};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone)]
struct Inner {
    track: Option<Track>,
    state: PlaybackState,
    alive: bool,
}

/// An in-memory player. Its state is whatever was last set on it, and the
/// transport commands act on that state directly: resume continues from the
/// paused position, pause freezes the position, skipping clears the track.
///
/// Useful for bridging players that are driven from elsewhere in the process
/// and for exercising the aggregator.
pub struct VirtualSource {
    id: SourceId,
    push: bool,
    inner: Mutex<Inner>,
    listeners: Listeners<ChangeFn>,
}

impl VirtualSource {
    pub fn new(id: impl Into<SourceId>) -> Self {
        Self::build(id.into(), true)
    }

    /// A source that never notifies; it is only seen through polling.
    pub fn polling_only(id: impl Into<SourceId>) -> Self {
        Self::build(id.into(), false)
    }

    fn build(id: SourceId, push: bool) -> Self {
        Self {
            id,
            push,
            inner: Mutex::new(Inner {
                track: None,
                state: PlaybackState::Stopped,
                alive: true,
            }),
            listeners: Listeners::new(),
        }
    }

    pub fn set(&self, track: Option<Track>, state: PlaybackState) {
        self.update(|inner| {
            inner.track = track;
            inner.state = state;
        });
    }

    pub fn set_track(&self, track: Option<Track>) {
        self.update(|inner| inner.track = track);
    }

    pub fn set_state(&self, state: PlaybackState) {
        self.update(|inner| inner.state = state);
    }

    pub fn set_alive(&self, alive: bool) {
        self.update(|inner| inner.alive = alive);
    }

    fn update(&self, change: impl FnOnce(&mut Inner)) {
        let snapshot = {
            let mut inner = lock(&self.inner);
            change(&mut inner);
            inner.clone()
        };
        if !self.push {
            return;
        }
        for listener in self.listeners.snapshot() {
            listener(snapshot.track.clone(), snapshot.state);
        }
    }
}

impl Source for VirtualSource {
    fn id(&self) -> SourceId {
        self.id.clone()
    }

    fn app(&self) -> SourceApp {
        SourceApp::Virtual
    }

    fn current_track(&self) -> Option<Track> {
        lock(&self.inner).track.clone()
    }

    fn current_state(&self) -> PlaybackState {
        lock(&self.inner).state
    }

    fn is_alive(&self) -> bool {
        lock(&self.inner).alive
    }

    fn supports_push(&self) -> bool {
        self.push
    }

    fn subscribe(&self, on_change: Arc<ChangeFn>) -> CancelHandle {
        if self.push {
            self.listeners.add(on_change)
        } else {
            CancelHandle::noop()
        }
    }

    fn resume(&self) {
        self.update(|inner| {
            if let PlaybackState::Paused { elapsed } = inner.state {
                inner.state = PlaybackState::playing_at(elapsed, SystemTime::now());
            }
        });
    }

    fn pause(&self) {
        self.update(|inner| {
            if inner.state.is_playing() {
                let elapsed = inner.state.elapsed(SystemTime::now());
                inner.state = PlaybackState::Paused { elapsed };
            }
        });
    }

    fn skip_next(&self) {
        self.update(stop);
    }

    fn skip_previous(&self) {
        self.update(stop);
    }

    fn seek(&self, position: Duration) {
        self.update(|inner| inner.state = inner.state.with_elapsed(position, SystemTime::now()));
    }
}

fn stop(inner: &mut Inner) {
    inner.track = None;
    inner.state = PlaybackState::Stopped;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::VirtualSource;
    use crate::{ChangeFn, Source};
    use nowplaying_core::{PlaybackKind, PlaybackState, Track};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, SystemTime};

    fn recorder(source: &VirtualSource) -> (Arc<Mutex<Vec<PlaybackKind>>>, nowplaying_core::CancelHandle) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: Arc<ChangeFn> = Arc::new(move |_: Option<Track>, state: PlaybackState| {
            sink.lock().unwrap().push(state.kind());
        });
        (seen, source.subscribe(callback))
    }

    #[test]
    fn transport_commands_follow_player_semantics() {
        let source = VirtualSource::new("v");
        source.set(Some(Track::new("song")), PlaybackState::Paused { elapsed: Duration::from_secs(30) });

        source.resume();
        let state = source.current_state();
        assert_eq!(state.kind(), PlaybackKind::Playing);
        let position = state.elapsed(SystemTime::now());
        assert!(position >= Duration::from_secs(30) && position < Duration::from_secs(31));

        source.seek(Duration::from_secs(90));
        let position = source.current_state().elapsed(SystemTime::now());
        assert!(position >= Duration::from_secs(90) && position < Duration::from_secs(91));

        source.pause();
        assert_eq!(source.current_state().kind(), PlaybackKind::Paused);

        source.skip_next();
        assert_eq!(source.current_track(), None);
        assert_eq!(source.current_state(), PlaybackState::Stopped);
    }

    #[test]
    fn resume_from_stopped_does_nothing() {
        let source = VirtualSource::new("v");
        source.resume();
        assert_eq!(source.current_state(), PlaybackState::Stopped);
    }

    #[test]
    fn notifies_subscribers_until_cancelled() {
        let source = VirtualSource::new("v");
        let (seen, handle) = recorder(&source);

        source.set_state(PlaybackState::Paused { elapsed: Duration::ZERO });
        source.set_alive(false);
        drop(handle);
        source.set_state(PlaybackState::Stopped);

        assert_eq!(*seen.lock().unwrap(), vec![PlaybackKind::Paused, PlaybackKind::Paused]);
        assert!(!source.is_alive());
    }

    #[test]
    fn polling_only_source_stays_silent() {
        let source = VirtualSource::polling_only("quiet");
        let (seen, _handle) = recorder(&source);
        source.set_state(PlaybackState::Paused { elapsed: Duration::ZERO });

        assert!(!source.supports_push());
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(source.current_state().kind(), PlaybackKind::Paused);
    }
}
