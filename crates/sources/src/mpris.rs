use crate::{Backend, BackendSnapshot, Command};
use anyhow::{Context, Result};
use async_trait::async_trait;
use nowplaying_core::{Artwork, PlaybackState, SourceApp, Track};
use std::collections::HashMap;
use std::time::{Duration, SystemTime};
use url::Url;
use zbus::zvariant::{ObjectPath, OwnedObjectPath, OwnedValue, Str};
use zbus::{Connection, Proxy};

const BUS_PREFIX: &str = "org.mpris.MediaPlayer2.";
const OBJECT_PATH: &str = "/org/mpris/MediaPlayer2";
const PLAYER_IFACE: &str = "org.mpris.MediaPlayer2.Player";

/// Player names (the part after `org.mpris.MediaPlayer2.`) currently on the
/// session bus, sorted.
pub async fn list_players() -> Result<Vec<String>> {
    let conn = Connection::session()
        .await
        .context("failed to connect DBus session")?;
    let proxy = Proxy::new(
        &conn,
        "org.freedesktop.DBus",
        "/org/freedesktop/DBus",
        "org.freedesktop.DBus",
    )
    .await?;

    let names: Vec<String> = proxy.call("ListNames", &()).await?;
    let mut players: Vec<String> = names
        .into_iter()
        .filter_map(|n| n.strip_prefix(BUS_PREFIX).map(str::to_string))
        .collect();
    players.sort();
    Ok(players)
}

/// One MPRIS player, addressed by bus name.
pub struct MprisBackend {
    bus_name: String,
    conn: Option<Connection>,
    track_path: Option<String>,
}

impl MprisBackend {
    pub fn for_player(player: &str) -> Self {
        Self {
            bus_name: format!("{BUS_PREFIX}{player}"),
            conn: None,
            track_path: None,
        }
    }

    async fn proxy(&mut self) -> Result<Proxy<'static>> {
        let conn = match &self.conn {
            Some(conn) => conn.clone(),
            None => {
                let conn = Connection::session()
                    .await
                    .context("failed to connect DBus session")?;
                self.conn = Some(conn.clone());
                conn
            }
        };
        let proxy = Proxy::new_owned(conn, self.bus_name.clone(), OBJECT_PATH, PLAYER_IFACE).await?;
        Ok(proxy)
    }

    fn ov_to_string(v: &OwnedValue) -> Option<String> {
        let owned = v.try_clone().ok()?;
        if let Ok(s) = String::try_from(owned.try_clone().ok()?) {
            return Some(s);
        }
        if let Ok(p) = OwnedObjectPath::try_from(owned.try_clone().ok()?) {
            return Some(p.as_str().to_string());
        }
        if let Ok(s) = Str::try_from(owned) {
            return Some(s.to_string());
        }
        None
    }

    fn ov_to_i64(v: &OwnedValue) -> Option<i64> {
        if let Ok(i) = <i64>::try_from(v) {
            return Some(i);
        }
        if let Ok(u) = <u64>::try_from(v) {
            return Some(u as i64);
        }
        None
    }

    fn artist_from_value(v: &OwnedValue) -> Option<String> {
        if let Ok(arr) = Vec::<String>::try_from(v.try_clone().ok()?) {
            return Some(arr.join(", ")).filter(|s| !s.is_empty());
        }
        None
    }

    fn micros(v: i64) -> Duration {
        Duration::from_micros(v.max(0) as u64)
    }

    fn track_from_metadata(metadata: &HashMap<String, OwnedValue>) -> Option<Track> {
        let title = metadata.get("xesam:title").and_then(Self::ov_to_string);
        let artist = metadata.get("xesam:artist").and_then(Self::artist_from_value);
        let album = metadata.get("xesam:album").and_then(Self::ov_to_string);
        let id = metadata
            .get("mpris:trackid")
            .and_then(Self::ov_to_string)
            .filter(|id| !id.is_empty() && id != "/org/mpris/MediaPlayer2/TrackList/NoTrack")
            .or_else(|| {
                // some players never publish a track id
                let fallback = format!(
                    "{}:{}",
                    artist.as_deref().unwrap_or_default(),
                    title.as_deref().unwrap_or_default()
                );
                Some(fallback).filter(|f| f != ":")
            })?;

        let mut track = Track::new(id);
        track.title = title;
        track.artist = artist;
        track.album = album;
        track.duration = metadata
            .get("mpris:length")
            .and_then(Self::ov_to_i64)
            .filter(|v| *v > 0)
            .map(Self::micros);
        track.artwork = metadata
            .get("mpris:artUrl")
            .and_then(Self::ov_to_string)
            .and_then(|raw| Url::parse(&raw).ok())
            .map(Artwork::Url);
        Some(track)
    }
}

#[async_trait]
impl Backend for MprisBackend {
    fn name(&self) -> &'static str {
        "mpris"
    }

    fn app(&self) -> SourceApp {
        SourceApp::Mpris
    }

    async fn poll(&mut self) -> Result<BackendSnapshot> {
        let proxy = self.proxy().await?;

        let status: String = match proxy.get_property("PlaybackStatus").await {
            Ok(status) => status,
            Err(err) => {
                // the bus name is gone: player quit
                self.conn = None;
                return Err(err).context("PlaybackStatus unavailable");
            }
        };
        if status == "Stopped" {
            self.track_path = None;
            return Ok(BackendSnapshot::stopped());
        }

        let metadata: HashMap<String, OwnedValue> = proxy.get_property("Metadata").await?;
        let track = Self::track_from_metadata(&metadata);
        self.track_path = metadata.get("mpris:trackid").and_then(Self::ov_to_string);

        let position_raw: i64 = proxy.get_property("Position").await.unwrap_or(0);
        let position = Self::micros(position_raw);

        let state = match status.as_str() {
            "Playing" => PlaybackState::playing_at(position, SystemTime::now()),
            _ => PlaybackState::Paused { elapsed: position },
        };

        Ok(BackendSnapshot::active(track, state))
    }

    async fn command(&mut self, command: Command) -> Result<()> {
        let proxy = self.proxy().await?;
        match command {
            Command::Resume => proxy.call_method("Play", &()).await?,
            Command::Pause => proxy.call_method("Pause", &()).await?,
            Command::PlayPause => proxy.call_method("PlayPause", &()).await?,
            Command::SkipNext => proxy.call_method("Next", &()).await?,
            Command::SkipPrevious => proxy.call_method("Previous", &()).await?,
            Command::Seek(position) => {
                let track_path = self
                    .track_path
                    .clone()
                    .context("cannot seek without a current track id")?;
                let path = ObjectPath::try_from(track_path.as_str())?;
                let micros = i64::try_from(position.as_micros()).unwrap_or(i64::MAX);
                proxy.call_method("SetPosition", &(path, micros)).await?
            }
        };
        Ok(())
    }
}
