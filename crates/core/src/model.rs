use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use url::Url;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceApp {
    AppleMusicMac,
    WindowsMediaSession,
    Mpris,
    Virtual,
    Unknown,
}

/// Stable handle naming one registered source, e.g. `apple_music` or `mpris:vlc`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SourceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaybackKind {
    Stopped,
    Playing,
    Paused,
    FastForwarding,
    Rewinding,
}

/// Playback progress of a source.
///
/// `Playing` stores the wall-clock instant at which elapsed time was zero
/// rather than the elapsed time itself, so the position can be read at any
/// later instant without asking the source again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlaybackState {
    #[default]
    Stopped,
    Playing { anchor: SystemTime },
    Paused { elapsed: Duration },
    FastForwarding { elapsed: Duration },
    Rewinding { elapsed: Duration },
}

impl PlaybackState {
    /// A playing state whose position at `now` is `elapsed`.
    pub fn playing_at(elapsed: Duration, now: SystemTime) -> Self {
        let anchor = now.checked_sub(elapsed).unwrap_or(UNIX_EPOCH);
        PlaybackState::Playing { anchor }
    }

    pub fn kind(&self) -> PlaybackKind {
        match self {
            PlaybackState::Stopped => PlaybackKind::Stopped,
            PlaybackState::Playing { .. } => PlaybackKind::Playing,
            PlaybackState::Paused { .. } => PlaybackKind::Paused,
            PlaybackState::FastForwarding { .. } => PlaybackKind::FastForwarding,
            PlaybackState::Rewinding { .. } => PlaybackKind::Rewinding,
        }
    }

    pub fn is_playing(&self) -> bool {
        matches!(
            self,
            PlaybackState::Playing { .. }
                | PlaybackState::FastForwarding { .. }
                | PlaybackState::Rewinding { .. }
        )
    }

    /// Position at `at`. A playing anchor later than `at` reads as zero.
    pub fn elapsed(&self, at: SystemTime) -> Duration {
        match *self {
            PlaybackState::Stopped => Duration::ZERO,
            PlaybackState::Playing { anchor } => at.duration_since(anchor).unwrap_or(Duration::ZERO),
            PlaybackState::Paused { elapsed }
            | PlaybackState::FastForwarding { elapsed }
            | PlaybackState::Rewinding { elapsed } => elapsed,
        }
    }

    /// Same kind, new position. `Playing` is rebased so that its position at
    /// `now` equals `elapsed`; `Stopped` has no position and is returned as is.
    pub fn with_elapsed(&self, elapsed: Duration, now: SystemTime) -> Self {
        match self {
            PlaybackState::Stopped => PlaybackState::Stopped,
            PlaybackState::Playing { .. } => PlaybackState::playing_at(elapsed, now),
            PlaybackState::Paused { .. } => PlaybackState::Paused { elapsed },
            PlaybackState::FastForwarding { .. } => PlaybackState::FastForwarding { elapsed },
            PlaybackState::Rewinding { .. } => PlaybackState::Rewinding { elapsed },
        }
    }

    /// Same kind and positions no further apart than `tolerance`.
    ///
    /// Two playing states advance together, so their distance is the distance
    /// between their anchors and does not depend on when it is measured.
    pub fn approximately_equal(&self, other: &PlaybackState, tolerance: Duration) -> bool {
        match (*self, *other) {
            (PlaybackState::Stopped, PlaybackState::Stopped) => true,
            (PlaybackState::Playing { anchor: a }, PlaybackState::Playing { anchor: b }) => {
                abs_diff_time(a, b) <= tolerance
            }
            (PlaybackState::Paused { elapsed: a }, PlaybackState::Paused { elapsed: b })
            | (
                PlaybackState::FastForwarding { elapsed: a },
                PlaybackState::FastForwarding { elapsed: b },
            )
            | (PlaybackState::Rewinding { elapsed: a }, PlaybackState::Rewinding { elapsed: b }) => {
                abs_diff(a, b) <= tolerance
            }
            _ => false,
        }
    }

    /// Clamps a playing anchor that lies after `now` back to `now`.
    pub fn normalized(self, now: SystemTime) -> Self {
        match self {
            PlaybackState::Playing { anchor } if anchor > now => PlaybackState::Playing { anchor: now },
            other => other,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            PlaybackState::Stopped => "stopped",
            PlaybackState::Playing { .. } => "playing",
            PlaybackState::Paused { .. } => "paused",
            PlaybackState::FastForwarding { .. } => "fast-forwarding",
            PlaybackState::Rewinding { .. } => "rewinding",
        }
    }
}

pub fn abs_diff(a: Duration, b: Duration) -> Duration {
    if a > b {
        a - b
    } else {
        b - a
    }
}

fn abs_diff_time(a: SystemTime, b: SystemTime) -> Duration {
    a.duration_since(b).unwrap_or_else(|err| err.duration())
}

/// Opaque artwork reference as handed over by a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artwork {
    Url(Url),
    Bytes(Arc<[u8]>),
}

/// A playable item. Two tracks are the same track when their ids match,
/// whatever their metadata says.
#[derive(Debug, Clone, Serialize)]
pub struct Track {
    pub id: String,
    pub title: Option<String>,
    pub album: Option<String>,
    pub artist: Option<String>,
    pub duration: Option<Duration>,
    #[serde(skip)]
    pub artwork: Option<Artwork>,
}

impl Track {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: None,
            album: None,
            artist: None,
            duration: None,
            artwork: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_artist(mut self, artist: impl Into<String>) -> Self {
        self.artist = Some(artist.into());
        self
    }

    pub fn with_album(mut self, album: impl Into<String>) -> Self {
        self.album = Some(album.into());
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_artwork(mut self, artwork: Artwork) -> Self {
        self.artwork = Some(artwork);
        self
    }

    pub fn is_valid(&self) -> bool {
        !self.id.trim().is_empty()
    }

    /// Field-by-field comparison, unlike `==` which only looks at the id.
    pub fn same_metadata(&self, other: &Track) -> bool {
        self.id == other.id
            && self.title == other.title
            && self.album == other.album
            && self.artist == other.artist
            && self.duration == other.duration
            && self.artwork == other.artwork
    }
}

impl PartialEq for Track {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Track {}

impl Hash for Track {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::{Artwork, PlaybackState, Track};
    use std::collections::HashSet;
    use std::time::{Duration, SystemTime};

    fn t0() -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    #[test]
    fn playing_elapsed_is_exact_distance_from_anchor() {
        let state = PlaybackState::Playing { anchor: t0() };
        for secs in [0_u64, 1, 59, 3_600, 86_400 * 3] {
            let at = t0() + Duration::from_secs(secs) + Duration::from_nanos(7);
            assert_eq!(state.elapsed(at), Duration::from_secs(secs) + Duration::from_nanos(7));
        }
        // sampling repeatedly does not move the answer
        let at = t0() + Duration::from_millis(12_345);
        assert_eq!(state.elapsed(at), state.elapsed(at));
    }

    #[test]
    fn future_anchor_reads_as_zero_and_normalizes_to_now() {
        let future = PlaybackState::Playing {
            anchor: t0() + Duration::from_secs(5),
        };
        assert_eq!(future.elapsed(t0()), Duration::ZERO);
        assert_eq!(future.normalized(t0()), PlaybackState::Playing { anchor: t0() });

        let past = PlaybackState::Playing { anchor: t0() };
        assert_eq!(past.normalized(t0() + Duration::from_secs(1)), past);
    }

    #[test]
    fn is_playing_covers_seeking_variants() {
        let d = Duration::from_secs(3);
        assert!(PlaybackState::Playing { anchor: t0() }.is_playing());
        assert!(PlaybackState::FastForwarding { elapsed: d }.is_playing());
        assert!(PlaybackState::Rewinding { elapsed: d }.is_playing());
        assert!(!PlaybackState::Paused { elapsed: d }.is_playing());
        assert!(!PlaybackState::Stopped.is_playing());
    }

    #[test]
    fn with_elapsed_keeps_kind_and_sets_position() {
        let d = Duration::from_secs(42);
        for state in [
            PlaybackState::Paused { elapsed: Duration::from_secs(1) },
            PlaybackState::FastForwarding { elapsed: Duration::from_secs(1) },
            PlaybackState::Rewinding { elapsed: Duration::from_secs(1) },
        ] {
            let moved = state.with_elapsed(d, t0());
            assert_eq!(moved.kind(), state.kind());
            assert_eq!(moved.elapsed(t0() + d), d);
        }

        let playing = PlaybackState::Playing { anchor: t0() }.with_elapsed(d, t0() + Duration::from_secs(100));
        assert_eq!(playing.elapsed(t0() + Duration::from_secs(100)), d);

        assert_eq!(PlaybackState::Stopped.with_elapsed(d, t0()), PlaybackState::Stopped);
    }

    #[test]
    fn approximate_equality_requires_same_kind() {
        let tol = Duration::from_millis(1_500);
        assert!(!PlaybackState::Stopped.approximately_equal(&PlaybackState::Paused { elapsed: Duration::ZERO }, tol));
        assert!(!PlaybackState::Paused { elapsed: Duration::ZERO }.approximately_equal(&PlaybackState::Stopped, tol));
        assert!(!PlaybackState::Paused { elapsed: Duration::ZERO }
            .approximately_equal(&PlaybackState::Rewinding { elapsed: Duration::ZERO }, tol));
    }

    #[test]
    fn approximate_equality_is_reflexive_and_symmetric() {
        let tol = Duration::from_secs(1);
        let a = PlaybackState::Playing { anchor: t0() };
        let b = PlaybackState::Playing {
            anchor: t0() + Duration::from_millis(800),
        };
        let c = PlaybackState::Playing {
            anchor: t0() + Duration::from_millis(1_200),
        };
        for s in [a, b, c, PlaybackState::Stopped, PlaybackState::Paused { elapsed: Duration::from_secs(9) }] {
            assert!(s.approximately_equal(&s, tol));
            assert!(s.approximately_equal(&s, Duration::ZERO));
        }
        assert!(a.approximately_equal(&b, tol));
        assert!(b.approximately_equal(&a, tol));
        assert!(!a.approximately_equal(&c, tol));
        assert!(!c.approximately_equal(&a, tol));
    }

    #[test]
    fn tracks_compare_by_id_only() {
        let bare = Track::new("t-1");
        let rich = Track::new("t-1")
            .with_title("Song")
            .with_artist("Band")
            .with_artwork(Artwork::Bytes(vec![1_u8, 2, 3].into()));
        assert_eq!(bare, rich);
        assert!(!bare.same_metadata(&rich));

        let mut set = HashSet::new();
        set.insert(bare);
        assert!(!set.insert(rich));
        assert_ne!(Track::new("t-1"), Track::new("t-2"));
    }

    #[test]
    fn blank_ids_are_invalid() {
        assert!(!Track::new("").is_valid());
        assert!(!Track::new("  ").is_valid());
        assert!(Track::new("spotify:track:1").is_valid());
    }
}
