use nowplaying_core::{PlaybackState, SelectionMode, SourceId};
use serde::Serialize;

/// One registered source as seen by the policy. Candidates are passed in
/// registration order, which is the tie-break order.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub id: &'a SourceId,
    pub state: PlaybackState,
    pub alive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionReason {
    Preferred,
    PreviousPlaying,
    FirstPlaying,
    PreviousAlive,
    FirstAlive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub id: SourceId,
    pub reason: SelectionReason,
}

/// Picks the single active source. Both policies check, in order:
///
/// | tier | `Layered`         | `ContinuityFirst` |
/// |------|-------------------|-------------------|
/// | 1    | preferred         | preferred         |
/// | 2    | previous, playing | previous, playing |
/// | 3    | first playing     | previous, alive   |
/// | 4    | previous, alive   | first playing     |
/// | 5    | first alive       | first alive       |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionPolicy {
    #[default]
    Layered,
    ContinuityFirst,
}

impl From<SelectionMode> for SelectionPolicy {
    fn from(mode: SelectionMode) -> Self {
        match mode {
            SelectionMode::Layered => SelectionPolicy::Layered,
            SelectionMode::ContinuityFirst => SelectionPolicy::ContinuityFirst,
        }
    }
}

impl SelectionPolicy {
    pub fn select(
        &self,
        candidates: &[Candidate<'_>],
        previous: Option<&SourceId>,
        preferred: Option<&SourceId>,
    ) -> Option<Selection> {
        let pick = |c: &Candidate<'_>, reason| {
            Some(Selection {
                id: c.id.clone(),
                reason,
            })
        };
        let find = |wanted: Option<&SourceId>| wanted.and_then(|id| candidates.iter().find(|c| c.id == id));

        if let Some(c) = find(preferred) {
            return pick(c, SelectionReason::Preferred);
        }

        let previous = find(previous);
        if let Some(c) = previous.filter(|c| c.alive && c.state.is_playing()) {
            return pick(c, SelectionReason::PreviousPlaying);
        }

        let first_playing = || candidates.iter().find(|c| c.alive && c.state.is_playing());
        let previous_alive = previous.filter(|c| c.alive);

        match self {
            SelectionPolicy::Layered => {
                if let Some(c) = first_playing() {
                    return pick(c, SelectionReason::FirstPlaying);
                }
                if let Some(c) = previous_alive {
                    return pick(c, SelectionReason::PreviousAlive);
                }
            }
            SelectionPolicy::ContinuityFirst => {
                if let Some(c) = previous_alive {
                    return pick(c, SelectionReason::PreviousAlive);
                }
                if let Some(c) = first_playing() {
                    return pick(c, SelectionReason::FirstPlaying);
                }
            }
        }

        candidates
            .iter()
            .find(|c| c.alive)
            .and_then(|c| pick(c, SelectionReason::FirstAlive))
    }
}
