use crate::{Backend, BackendSnapshot, Command};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use nowplaying_core::{PlaybackState, SourceApp, Track};
use serde::Deserialize;
use std::time::{Duration, SystemTime};
use tokio::process::Command as Process;

const NOW_PLAYING_JXA: &str = r#"
(function () {
  const music = Application("Music");
  if (!music.running()) {
    return JSON.stringify({ running: false, state: "stopped" });
  }
  try {
    const state = String(music.playerState());
    if (state === "stopped") {
      return JSON.stringify({ running: true, state: state });
    }
    const t = music.currentTrack();
    return JSON.stringify({
      running: true,
      state: state,
      title: t.name(),
      artist: t.artist(),
      album: t.album(),
      duration: t.duration(),
      position: music.playerPosition(),
      persistentId: t.persistentID()
    });
  } catch (e) {
    return JSON.stringify({ running: true, state: "stopped", error: String(e) });
  }
})();
"#;

/// Apple Music on macOS, driven through `osascript`.
#[derive(Default)]
pub struct AppleMusicBackend;

#[derive(Debug, Deserialize)]
struct JxaResult {
    running: bool,
    state: String,
    title: Option<String>,
    artist: Option<String>,
    album: Option<String>,
    /// seconds
    duration: Option<f64>,
    /// seconds
    position: Option<f64>,
    #[serde(rename = "persistentId")]
    persistent_id: Option<String>,
    error: Option<String>,
}

impl AppleMusicBackend {
    pub fn new() -> Self {
        Self
    }

    async fn osascript(args: &[&str]) -> Result<String> {
        let output = Process::new("osascript")
            .args(args)
            .output()
            .await
            .context("failed to run osascript for Apple Music")?;

        if !output.status.success() {
            return Err(anyhow!(
                "osascript failed: {}",
                String::from_utf8_lossy(&output.stderr)
            ));
        }
        String::from_utf8(output.stdout).context("invalid UTF-8 from osascript")
    }

    fn seconds(value: Option<f64>) -> Option<Duration> {
        value
            .and_then(|v| Duration::try_from_secs_f64(v).ok())
    }
}

#[async_trait]
impl Backend for AppleMusicBackend {
    fn name(&self) -> &'static str {
        "apple_music"
    }

    fn app(&self) -> SourceApp {
        SourceApp::AppleMusicMac
    }

    async fn poll(&mut self) -> Result<BackendSnapshot> {
        let stdout = Self::osascript(&["-l", "JavaScript", "-e", NOW_PLAYING_JXA]).await?;
        let parsed: JxaResult =
            serde_json::from_str(stdout.trim()).context("invalid JSON from jxa script")?;

        if !parsed.running {
            return Ok(BackendSnapshot::not_running());
        }
        if let Some(err) = parsed.error {
            return Ok(BackendSnapshot {
                last_error: Some(err),
                ..BackendSnapshot::stopped()
            });
        }

        let position = Self::seconds(parsed.position).unwrap_or_default();
        let state = match parsed.state.as_str() {
            "playing" => PlaybackState::playing_at(position, SystemTime::now()),
            "paused" => PlaybackState::Paused { elapsed: position },
            "fast forwarding" => PlaybackState::FastForwarding { elapsed: position },
            "rewinding" => PlaybackState::Rewinding { elapsed: position },
            _ => return Ok(BackendSnapshot::stopped()),
        };

        let track = parsed.persistent_id.map(|id| {
            let mut track = Track::new(id);
            track.title = parsed.title;
            track.artist = parsed.artist;
            track.album = parsed.album;
            track.duration = Self::seconds(parsed.duration);
            track
        });

        Ok(BackendSnapshot::active(track, state))
    }

    async fn command(&mut self, command: Command) -> Result<()> {
        let script = match command {
            Command::Resume => "tell application \"Music\" to play".to_string(),
            Command::Pause => "tell application \"Music\" to pause".to_string(),
            Command::PlayPause => "tell application \"Music\" to playpause".to_string(),
            Command::SkipNext => "tell application \"Music\" to next track".to_string(),
            Command::SkipPrevious => "tell application \"Music\" to previous track".to_string(),
            Command::Seek(position) => format!(
                "tell application \"Music\" to set player position to {:.3}",
                position.as_secs_f64()
            ),
        };
        Self::osascript(&["-e", &script]).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::AppleMusicBackend;
    use std::time::Duration;

    #[test]
    fn out_of_range_seconds_are_dropped() {
        assert_eq!(AppleMusicBackend::seconds(Some(12.5)), Some(Duration::from_millis(12_500)));
        assert_eq!(AppleMusicBackend::seconds(Some(-1.0)), None);
        assert_eq!(AppleMusicBackend::seconds(Some(f64::NAN)), None);
        assert_eq!(AppleMusicBackend::seconds(Some(1e300)), None);
        assert_eq!(AppleMusicBackend::seconds(None), None);
    }
}
