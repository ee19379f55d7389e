use anyhow::Result;
use async_trait::async_trait;
use nowplaying_core::{CancelHandle, PlaybackState, SourceApp, SourceId, Track};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

mod polled;
mod virtual_source;

pub use polled::PolledSource;
pub use virtual_source::VirtualSource;

/// Change callback handed to [`Source::subscribe`].
pub type ChangeFn = dyn Fn(Option<Track>, PlaybackState) + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Resume,
    Pause,
    PlayPause,
    SkipNext,
    SkipPrevious,
    Seek(Duration),
}

/// One media backend as seen by the aggregator.
///
/// Snapshot accessors must answer from memory: any talking to the real player
/// happens on the source's own worker. Commands are fire-and-forget.
pub trait Source: Send + Sync {
    fn id(&self) -> SourceId;
    fn app(&self) -> SourceApp;

    fn current_track(&self) -> Option<Track>;
    fn current_state(&self) -> PlaybackState;

    /// `false` when the player is gone or cannot be reached. Sources that
    /// cannot tell "stopped" from "dead" should answer `false`.
    fn is_alive(&self) -> bool;

    /// Whether `subscribe` delivers changes as they happen. Sources answering
    /// `false` are only read on the aggregator's fallback tick.
    fn supports_push(&self) -> bool;

    /// Most recent failure talking to the player, for diagnostics.
    fn last_error(&self) -> Option<String> {
        None
    }

    fn subscribe(&self, on_change: Arc<ChangeFn>) -> CancelHandle;

    fn resume(&self);
    fn pause(&self);
    fn skip_next(&self);
    fn skip_previous(&self);
    fn seek(&self, position: Duration);

    fn play_pause(&self) {
        if self.current_state().is_playing() {
            self.pause();
        } else {
            self.resume();
        }
    }

    fn execute(&self, command: Command) {
        match command {
            Command::Resume => self.resume(),
            Command::Pause => self.pause(),
            Command::PlayPause => self.play_pause(),
            Command::SkipNext => self.skip_next(),
            Command::SkipPrevious => self.skip_previous(),
            Command::Seek(position) => self.seek(position),
        }
    }
}

/// What a backend saw on its last poll.
#[derive(Debug, Clone)]
pub struct BackendSnapshot {
    pub alive: bool,
    pub track: Option<Track>,
    pub state: PlaybackState,
    pub last_error: Option<String>,
}

impl BackendSnapshot {
    pub fn active(track: Option<Track>, state: PlaybackState) -> Self {
        Self {
            alive: true,
            track,
            state,
            last_error: None,
        }
    }

    /// Player running with nothing loaded.
    pub fn stopped() -> Self {
        Self::active(None, PlaybackState::Stopped)
    }

    pub fn not_running() -> Self {
        Self {
            alive: false,
            track: None,
            state: PlaybackState::Stopped,
            last_error: None,
        }
    }

    pub fn with_error(err: impl ToString) -> Self {
        Self {
            last_error: Some(err.to_string()),
            ..Self::not_running()
        }
    }

    /// Track identity, exact state and liveness all match.
    pub fn same_as(&self, other: &BackendSnapshot) -> bool {
        self.alive == other.alive && self.track == other.track && self.state == other.state
    }
}

/// A player integration that can only be reached asynchronously.
/// [`PolledSource`] turns one into a [`Source`].
#[async_trait]
pub trait Backend: Send {
    fn name(&self) -> &'static str;
    fn app(&self) -> SourceApp;
    async fn poll(&mut self) -> Result<BackendSnapshot>;
    async fn command(&mut self, command: Command) -> Result<()>;
}

pub const APPLE_MUSIC_ID: &str = "apple_music";
pub const WINDOWS_ID: &str = "windows";
pub const MPRIS_PREFIX: &str = "mpris:";

/// Ids of the sources currently reachable, in `priority` order. Families
/// that do not exist on this platform are skipped.
pub async fn available_source_ids(priority: &[String]) -> Vec<SourceId> {
    let mut ids = Vec::new();
    for item in priority {
        match item.as_str() {
            "apple_music" => {
                if platform::HAS_APPLE_MUSIC {
                    ids.push(SourceId::new(APPLE_MUSIC_ID));
                }
            }
            "windows" => {
                if platform::HAS_WINDOWS {
                    ids.push(SourceId::new(WINDOWS_ID));
                }
            }
            "mpris" => {
                for player in platform::mpris_players().await {
                    ids.push(SourceId::new(format!("{MPRIS_PREFIX}{player}")));
                }
            }
            other => {
                tracing::warn!(family = other, "unknown source family in priority list");
            }
        }
    }
    ids
}

/// Opens the source behind `id`, or `None` when it is not available on this
/// platform. Must be called inside a tokio runtime.
pub fn open_source(id: &SourceId, poll_interval: Duration) -> Option<Arc<dyn Source>> {
    let id_str = id.as_str();
    if id_str == APPLE_MUSIC_ID {
        return platform::apple_music_source(id.clone(), poll_interval);
    }
    if id_str == WINDOWS_ID {
        return platform::windows_source(id.clone(), poll_interval);
    }
    if let Some(player) = id_str.strip_prefix(MPRIS_PREFIX) {
        return platform::mpris_source(id.clone(), player, poll_interval);
    }
    None
}

/// Discovers and opens every available source in `priority` order.
pub async fn build_sources(priority: &[String], poll_interval: Duration) -> Vec<Arc<dyn Source>> {
    available_source_ids(priority)
        .await
        .iter()
        .filter_map(|id| open_source(id, poll_interval))
        .collect()
}

mod platform {
    use super::Source;
    use nowplaying_core::SourceId;
    use std::sync::Arc;
    use std::time::Duration;

    pub const HAS_APPLE_MUSIC: bool = cfg!(target_os = "macos");
    pub const HAS_WINDOWS: bool = cfg!(target_os = "windows");

    #[cfg(target_os = "linux")]
    pub async fn mpris_players() -> Vec<String> {
        match crate::mpris::list_players().await {
            Ok(players) => players,
            Err(err) => {
                tracing::debug!(error = %err, "mpris discovery failed");
                Vec::new()
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub async fn mpris_players() -> Vec<String> {
        Vec::new()
    }

    #[cfg(target_os = "linux")]
    pub fn mpris_source(id: SourceId, player: &str, interval: Duration) -> Option<Arc<dyn Source>> {
        let backend = crate::mpris::MprisBackend::for_player(player);
        Some(crate::PolledSource::spawn(id, backend, interval))
    }

    #[cfg(not(target_os = "linux"))]
    pub fn mpris_source(_id: SourceId, _player: &str, _interval: Duration) -> Option<Arc<dyn Source>> {
        None
    }

    #[cfg(target_os = "macos")]
    pub fn apple_music_source(id: SourceId, interval: Duration) -> Option<Arc<dyn Source>> {
        let backend = crate::macos::AppleMusicBackend::new();
        Some(crate::PolledSource::spawn(id, backend, interval))
    }

    #[cfg(not(target_os = "macos"))]
    pub fn apple_music_source(_id: SourceId, _interval: Duration) -> Option<Arc<dyn Source>> {
        None
    }

    #[cfg(target_os = "windows")]
    pub fn windows_source(id: SourceId, interval: Duration) -> Option<Arc<dyn Source>> {
        let backend = crate::windows::WindowsGsmtcBackend::new();
        Some(crate::PolledSource::spawn(id, backend, interval))
    }

    #[cfg(not(target_os = "windows"))]
    pub fn windows_source(_id: SourceId, _interval: Duration) -> Option<Arc<dyn Source>> {
        None
    }
}

#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "linux")]
mod mpris;
#[cfg(target_os = "windows")]
mod windows;

#[cfg(test)]
mod tests {
    use super::{open_source, BackendSnapshot, Command, Source, VirtualSource};
    use nowplaying_core::{PlaybackState, SourceId, Track};
    use std::time::Duration;

    #[test]
    fn play_pause_is_derived_from_is_playing() {
        let source = VirtualSource::new("v");
        source.set(Some(Track::new("a")), PlaybackState::Paused { elapsed: Duration::from_secs(3) });

        source.play_pause();
        assert!(source.current_state().is_playing());

        source.execute(Command::PlayPause);
        assert_eq!(source.current_state().kind(), nowplaying_core::PlaybackKind::Paused);
    }

    #[test]
    fn snapshot_equality_ignores_metadata_and_errors() {
        let a = BackendSnapshot::active(Some(Track::new("x").with_title("One")), PlaybackState::Stopped);
        let b = BackendSnapshot::active(Some(Track::new("x").with_title("Two")), PlaybackState::Stopped);
        assert!(a.same_as(&b));
        assert!(!a.same_as(&BackendSnapshot::not_running()));
        assert!(BackendSnapshot::with_error("boom").same_as(&BackendSnapshot::not_running()));
    }

    #[test]
    fn unknown_ids_do_not_open() {
        assert!(open_source(&SourceId::new("winamp"), Duration::from_secs(1)).is_none());
    }
}
