use nowplaying_core::{AppConfig, SourceId};
use std::time::Duration;

mod aggregator;
pub mod reconcile;
mod scheduler;
pub mod selection;

pub use aggregator::{Aggregator, AggregatorError, NowPlaying, ObserverFn};
pub use reconcile::{reconcile, reconcile_update, Decision, DiffKind, SourceSnapshot};
pub use scheduler::Scheduler;
pub use selection::{Candidate, Selection, SelectionPolicy, SelectionReason};

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Safety-net period for re-reading sources.
    pub fallback_poll_interval: Duration,
    /// Drift allowed before a polled source's position is republished.
    pub reconcile_tolerance: Duration,
    /// Same, for sources that push their own notifications.
    pub push_tolerance: Duration,
    /// Whether the fallback tick also re-reads push sources.
    pub poll_push_sources: bool,
    pub selection: SelectionPolicy,
    pub preferred_source: Option<SourceId>,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            fallback_poll_interval: Duration::from_secs(1),
            reconcile_tolerance: reconcile::POLLED_TOLERANCE,
            push_tolerance: reconcile::PUSH_TOLERANCE,
            poll_push_sources: true,
            selection: SelectionPolicy::default(),
            preferred_source: None,
        }
    }
}

impl AggregatorConfig {
    pub fn from_app_config(cfg: &AppConfig) -> Self {
        Self {
            fallback_poll_interval: Duration::from_millis(cfg.intervals.fallback_poll_ms),
            reconcile_tolerance: Duration::from_millis(cfg.tolerances.polled_ms),
            push_tolerance: Duration::from_millis(cfg.tolerances.push_ms),
            poll_push_sources: cfg.poll_push_sources,
            selection: cfg.selection.into(),
            preferred_source: cfg
                .preferred_source
                .as_deref()
                .filter(|s| !s.is_empty())
                .map(SourceId::new),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AggregatorConfig, SelectionPolicy};
    use nowplaying_core::{AppConfig, SelectionMode, SourceId};
    use std::time::Duration;

    #[test]
    fn defaults_match_app_config_defaults() {
        let from_app = AggregatorConfig::from_app_config(&AppConfig::default());
        let default = AggregatorConfig::default();
        assert_eq!(from_app.fallback_poll_interval, default.fallback_poll_interval);
        assert_eq!(from_app.reconcile_tolerance, default.reconcile_tolerance);
        assert_eq!(from_app.push_tolerance, default.push_tolerance);
        assert_eq!(from_app.poll_push_sources, default.poll_push_sources);
        assert_eq!(from_app.selection, default.selection);
        assert_eq!(from_app.preferred_source, None);
    }

    #[test]
    fn app_config_overrides_are_carried() {
        let mut app = AppConfig::default();
        app.intervals.fallback_poll_ms = 250;
        app.tolerances.polled_ms = 2_000;
        app.selection = SelectionMode::ContinuityFirst;
        app.preferred_source = Some("mpris:vlc".to_string());

        let cfg = AggregatorConfig::from_app_config(&app);
        assert_eq!(cfg.fallback_poll_interval, Duration::from_millis(250));
        assert_eq!(cfg.reconcile_tolerance, Duration::from_secs(2));
        assert_eq!(cfg.selection, SelectionPolicy::ContinuityFirst);
        assert_eq!(cfg.preferred_source, Some(SourceId::new("mpris:vlc")));

        app.preferred_source = Some(String::new());
        assert_eq!(AggregatorConfig::from_app_config(&app).preferred_source, None);
    }
}
