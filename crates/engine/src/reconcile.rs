use nowplaying_core::model::abs_diff;
use nowplaying_core::{PlaybackState, Track};
use std::time::{Duration, SystemTime};

/// Default drift allowed for sources that are only polled.
pub const POLLED_TOLERANCE: Duration = Duration::from_millis(1_500);
/// Default drift allowed for sources that push their own notifications.
pub const PUSH_TOLERANCE: Duration = Duration::from_millis(1_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Publish(PlaybackState),
    Suppress,
}

/// A change of kind always publishes. Within a kind, the update publishes only
/// when the two positions, read at `now`, are more than `tolerance` apart.
pub fn reconcile(
    previous: &PlaybackState,
    incoming: &PlaybackState,
    tolerance: Duration,
    now: SystemTime,
) -> Decision {
    if previous.kind() != incoming.kind() {
        return Decision::Publish(*incoming);
    }
    let drift = abs_diff(previous.elapsed(now), incoming.elapsed(now));
    if drift > tolerance {
        Decision::Publish(*incoming)
    } else {
        Decision::Suppress
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffKind {
    TrackChanged,
    StateChanged,
    /// Same track id and a state within tolerance, but title, artwork or
    /// similar moved.
    MetadataChanged,
    Nothing,
}

/// Last accepted view of one source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceSnapshot {
    pub track: Option<Track>,
    pub state: PlaybackState,
}

impl SourceSnapshot {
    pub fn new(track: Option<Track>, state: PlaybackState) -> Self {
        Self { track, state }
    }
}

/// Folds `incoming` into `previous`.
///
/// A different track id replaces everything, even a position that jumped
/// backwards. Otherwise the state goes through [`reconcile`]; a suppressed
/// state keeps the previous anchor so that sub-tolerance jitter never
/// accumulates.
pub fn reconcile_update(
    previous: &SourceSnapshot,
    incoming: SourceSnapshot,
    tolerance: Duration,
    now: SystemTime,
) -> (DiffKind, SourceSnapshot) {
    let previous_id = previous.track.as_ref().map(|t| t.id.as_str());
    let incoming_id = incoming.track.as_ref().map(|t| t.id.as_str());
    if previous_id != incoming_id {
        return (DiffKind::TrackChanged, incoming);
    }

    match reconcile(&previous.state, &incoming.state, tolerance, now) {
        Decision::Publish(state) => (DiffKind::StateChanged, SourceSnapshot::new(incoming.track, state)),
        Decision::Suppress => {
            let metadata_moved = match (&previous.track, &incoming.track) {
                (Some(a), Some(b)) => !a.same_metadata(b),
                _ => false,
            };
            if metadata_moved {
                (
                    DiffKind::MetadataChanged,
                    SourceSnapshot::new(incoming.track, previous.state),
                )
            } else {
                (DiffKind::Nothing, previous.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{reconcile, reconcile_update, Decision, DiffKind, SourceSnapshot, POLLED_TOLERANCE, PUSH_TOLERANCE};
    use nowplaying_core::{PlaybackState, Track};
    use std::time::{Duration, SystemTime};

    fn t0() -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    fn playing(offset_ms: u64) -> PlaybackState {
        PlaybackState::Playing {
            anchor: t0() + Duration::from_millis(offset_ms),
        }
    }

    #[test]
    fn small_anchor_drift_is_suppressed() {
        let now = t0() + Duration::from_secs(60);
        assert_eq!(reconcile(&playing(0), &playing(300), POLLED_TOLERANCE, now), Decision::Suppress);
        assert_eq!(
            reconcile(&playing(0), &playing(2_000), POLLED_TOLERANCE, now),
            Decision::Publish(playing(2_000))
        );
    }

    #[test]
    fn push_tolerance_is_tighter() {
        let now = t0() + Duration::from_secs(60);
        assert_eq!(reconcile(&playing(0), &playing(1_200), POLLED_TOLERANCE, now), Decision::Suppress);
        assert_eq!(
            reconcile(&playing(0), &playing(1_200), PUSH_TOLERANCE, now),
            Decision::Publish(playing(1_200))
        );
    }

    #[test]
    fn kind_changes_always_publish() {
        let now = t0() + Duration::from_secs(10);
        let paused = PlaybackState::Paused {
            elapsed: Duration::from_secs(10),
        };
        // same position, different kind
        assert_eq!(reconcile(&playing(0), &paused, POLLED_TOLERANCE, now), Decision::Publish(paused));
        assert_eq!(
            reconcile(&PlaybackState::Stopped, &PlaybackState::Paused { elapsed: Duration::ZERO }, POLLED_TOLERANCE, now),
            Decision::Publish(PlaybackState::Paused { elapsed: Duration::ZERO })
        );
        assert_eq!(
            reconcile(&PlaybackState::Stopped, &PlaybackState::Stopped, Duration::ZERO, now),
            Decision::Suppress
        );
    }

    #[test]
    fn new_track_replaces_state_even_when_within_tolerance() {
        let now = t0() + Duration::from_secs(120);
        let previous = SourceSnapshot::new(Some(Track::new("a")), playing(0));
        let incoming = SourceSnapshot::new(Some(Track::new("b")), playing(500));

        let (diff, next) = reconcile_update(&previous, incoming.clone(), POLLED_TOLERANCE, now);
        assert_eq!(diff, DiffKind::TrackChanged);
        assert_eq!(next.state, incoming.state);

        let (diff, next) = reconcile_update(&next, SourceSnapshot::default(), POLLED_TOLERANCE, now);
        assert_eq!(diff, DiffKind::TrackChanged);
        assert_eq!(next, SourceSnapshot::default());
    }

    #[test]
    fn suppressed_update_keeps_previous_anchor() {
        let now = t0() + Duration::from_secs(30);
        let previous = SourceSnapshot::new(Some(Track::new("a")), playing(0));
        let (diff, next) = reconcile_update(
            &previous,
            SourceSnapshot::new(Some(Track::new("a")), playing(900)),
            POLLED_TOLERANCE,
            now,
        );
        assert_eq!(diff, DiffKind::Nothing);
        assert_eq!(next.state, playing(0));
    }

    #[test]
    fn late_metadata_is_a_metadata_change_not_a_track_change() {
        let now = t0() + Duration::from_secs(30);
        let previous = SourceSnapshot::new(Some(Track::new("a")), playing(0));
        let enriched = Track::new("a").with_title("Song").with_artist("Band");
        let (diff, next) = reconcile_update(
            &previous,
            SourceSnapshot::new(Some(enriched), playing(100)),
            POLLED_TOLERANCE,
            now,
        );
        assert_eq!(diff, DiffKind::MetadataChanged);
        assert_eq!(next.state, playing(0));
        assert_eq!(next.track.and_then(|t| t.title).as_deref(), Some("Song"));
    }
}
