pub mod config;
pub mod model;
pub mod notify;

pub use config::{AppConfig, ConfigError, ConfigIntervals, SelectionMode, ToleranceConfig};
pub use model::{Artwork, PlaybackKind, PlaybackState, SourceApp, SourceId, Track};
pub use notify::{CancelHandle, Listeners};
