use crate::{Backend, BackendSnapshot, Command};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use nowplaying_core::{PlaybackState, SourceApp, Track};
use std::time::{Duration, SystemTime};
use windows::Media::Control::{
    GlobalSystemMediaTransportControlsSession, GlobalSystemMediaTransportControlsSessionManager,
    GlobalSystemMediaTransportControlsSessionPlaybackStatus as Status,
};

/// The system-wide current media session (GSMTC).
#[derive(Default)]
pub struct WindowsGsmtcBackend;

impl WindowsGsmtcBackend {
    pub fn new() -> Self {
        Self
    }

    fn session() -> Result<Option<GlobalSystemMediaTransportControlsSession>> {
        let manager = GlobalSystemMediaTransportControlsSessionManager::RequestAsync()?.get()?;
        Ok(manager.GetCurrentSession().ok())
    }

    /// TimeSpan ticks are 100ns.
    fn from_ticks(ticks: i64) -> Duration {
        Duration::from_nanos((ticks.max(0) as u64).saturating_mul(100))
    }
}

#[async_trait]
impl Backend for WindowsGsmtcBackend {
    fn name(&self) -> &'static str {
        "windows"
    }

    fn app(&self) -> SourceApp {
        SourceApp::WindowsMediaSession
    }

    async fn poll(&mut self) -> Result<BackendSnapshot> {
        let session = match Self::session()? {
            Some(s) => s,
            None => return Ok(BackendSnapshot::not_running()),
        };

        let props = session.TryGetMediaPropertiesAsync()?.get()?;
        let playback = session.GetPlaybackInfo()?;
        let timeline = session.GetTimelineProperties()?;

        let title = props.Title()?.to_string_lossy();
        let artist = props.Artist()?.to_string_lossy();
        let album = props.AlbumTitle()?.to_string_lossy();
        let status = playback.PlaybackStatus()?;

        if status == Status::Closed {
            return Ok(BackendSnapshot::not_running());
        }

        let position = Self::from_ticks(timeline.Position()?.Duration);
        let length = timeline.EndTime()?.Duration - timeline.StartTime()?.Duration;

        let state = match status {
            Status::Playing => PlaybackState::playing_at(position, SystemTime::now()),
            Status::Paused => PlaybackState::Paused { elapsed: position },
            _ => PlaybackState::Stopped,
        };

        let track = if title.is_empty() && artist.is_empty() {
            None
        } else {
            let mut track = Track::new(format!("{}:{}:{}", artist, title, album));
            track.title = Some(title).filter(|s| !s.is_empty());
            track.artist = Some(artist).filter(|s| !s.is_empty());
            track.album = Some(album).filter(|s| !s.is_empty());
            track.duration = Some(length).filter(|l| *l > 0).map(Self::from_ticks);
            Some(track)
        };

        Ok(BackendSnapshot::active(track, state))
    }

    async fn command(&mut self, command: Command) -> Result<()> {
        let session = Self::session()?.ok_or_else(|| anyhow!("no media session"))?;
        let accepted = match command {
            Command::Resume => session.TryPlayAsync()?.get()?,
            Command::Pause => session.TryPauseAsync()?.get()?,
            Command::PlayPause => session.TryTogglePlayPauseAsync()?.get()?,
            Command::SkipNext => session.TrySkipNextAsync()?.get()?,
            Command::SkipPrevious => session.TrySkipPreviousAsync()?.get()?,
            Command::Seek(position) => {
                let ticks = i64::try_from(position.as_nanos() / 100).unwrap_or(i64::MAX);
                session.TryChangePlaybackPositionAsync(ticks)?.get()?
            }
        };
        if !accepted {
            return Err(anyhow!("session rejected {command:?}"));
        }
        Ok(())
    }
}
