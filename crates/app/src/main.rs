use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use nowplaying_core::{AppConfig, PlaybackState, SourceId, Track};
use nowplaying_engine::{Aggregator, AggregatorConfig, NowPlaying};
use nowplaying_sources::{available_source_ids, build_sources, open_source, Command, Source};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// How long one-shot commands let freshly opened sources report in.
const WARMUP: Duration = Duration::from_millis(750);

#[derive(Parser, Debug)]
#[command(
    name = "nowplaying",
    about = "Media players -> Aggregator -> one now-playing feed"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Follow the active player and print every change.
    Run,
    /// Print what is playing right now.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// List the players that can be reached.
    Sources,
    /// Send a transport command to the active player.
    Control {
        #[command(subcommand)]
        action: ControlAction,

        /// Target this source instead of the automatically selected one.
        #[arg(long, global = true)]
        source: Option<String>,
    },
    Doctor,
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq)]
enum ControlAction {
    Resume,
    Pause,
    Toggle,
    Next,
    Previous,
    Seek { seconds: f64 },
}

impl ControlAction {
    fn to_command(self) -> Result<Command> {
        Ok(match self {
            ControlAction::Resume => Command::Resume,
            ControlAction::Pause => Command::Pause,
            ControlAction::Toggle => Command::PlayPause,
            ControlAction::Next => Command::SkipNext,
            ControlAction::Previous => Command::SkipPrevious,
            ControlAction::Seek { seconds } => Command::Seek(
                Duration::try_from_secs_f64(seconds)
                    .context("seek position must be a non-negative number of seconds")?,
            ),
        })
    }
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cmd = cli.command.unwrap_or(Commands::Run);
    let cfg_path = cli.config.unwrap_or_else(default_config_path);

    match cmd {
        Commands::Config {
            action: ConfigAction::Init,
        } => {
            init_config(&cfg_path)?;
            println!("Initialized config at {}", cfg_path.display());
            Ok(())
        }
        Commands::Doctor => {
            let cfg = load_or_default(&cfg_path);
            if let Ok(cfg) = &cfg {
                init_logging(&cfg.log_level);
            }
            doctor(&cfg_path, cfg).await
        }
        Commands::Status { json } => {
            let cfg = load_or_default(&cfg_path)?;
            init_logging(&cfg.log_level);
            status(&cfg, json).await
        }
        Commands::Sources => {
            let cfg = load_or_default(&cfg_path)?;
            init_logging(&cfg.log_level);
            list_sources(&cfg).await
        }
        Commands::Control { action, source } => {
            let cfg = load_or_default(&cfg_path)?;
            init_logging(&cfg.log_level);
            control(&cfg, action, source).await
        }
        Commands::Run => {
            let cfg = load_or_default(&cfg_path)?;
            init_logging(&cfg.log_level);
            run(cfg, cfg_path).await
        }
    }
}

async fn run(mut cfg: AppConfig, cfg_path: PathBuf) -> Result<()> {
    let sources = build_sources(&cfg.source_priority, backend_poll(&cfg)).await;
    let aggregator = Aggregator::new(AggregatorConfig::from_app_config(&cfg), sources);
    let _printer = aggregator.subscribe(|np: &NowPlaying| println!("{}", describe(np, SystemTime::now())));

    info!(sources = ?id_strings(&aggregator.source_ids()), "nowplaying started");

    let (reload_tx, mut reload_rx) = mpsc::channel::<()>(4);
    spawn_reload_watchers(cfg_path.clone(), cfg.intervals.file_watch_poll_ms, reload_tx).await?;

    let mut discovery = discovery_timer(&cfg);

    loop {
        tokio::select! {
            _ = discovery.tick() => {
                rediscover(&aggregator, &cfg).await;
            }
            msg = reload_rx.recv() => {
                if msg.is_some() {
                    match load_or_default(&cfg_path) {
                        Ok(new_cfg) => {
                            apply_reload(&aggregator, &cfg, &new_cfg);
                            if new_cfg.intervals.discovery_ms != cfg.intervals.discovery_ms {
                                discovery = discovery_timer(&new_cfg);
                            }
                            cfg = new_cfg;
                            info!("configuration reloaded");
                        }
                        Err(err) => {
                            error!(error=%err, "failed to reload config");
                        }
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received ctrl-c; shutting down");
                break;
            }
        }
    }

    aggregator.stop().await;
    Ok(())
}

fn discovery_timer(cfg: &AppConfig) -> tokio::time::Interval {
    let mut timer = tokio::time::interval(Duration::from_millis(cfg.intervals.discovery_ms));
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

/// Brings the aggregator's membership in line with the players that can be
/// reached right now.
async fn rediscover(aggregator: &Aggregator, cfg: &AppConfig) {
    let available = available_source_ids(&cfg.source_priority).await;
    let registered = aggregator.source_ids();

    for id in registered.iter().filter(|id| !available.contains(id)) {
        match aggregator.remove_source(id) {
            Ok(()) => info!(source = %id, "player disappeared"),
            Err(err) => warn!(source = %id, error = %err, "failed to remove source"),
        }
    }

    for id in available.iter().filter(|id| !registered.contains(id)) {
        let Some(source) = open_source(id, backend_poll(cfg)) else {
            debug!(source = %id, "source not supported on this platform");
            continue;
        };
        match aggregator.add_source(source) {
            Ok(()) => info!(source = %id, "player appeared"),
            Err(err) => warn!(source = %id, error = %err, "failed to add source"),
        }
    }
}

/// Pushes the settings that can change at runtime into the running
/// aggregator. Everything else is read once at startup.
fn apply_reload(aggregator: &Aggregator, old: &AppConfig, new: &AppConfig) {
    if old.intervals.fallback_poll_ms != new.intervals.fallback_poll_ms {
        let interval = Duration::from_millis(new.intervals.fallback_poll_ms);
        if let Err(err) = aggregator.set_fallback_poll_interval(interval) {
            error!(error = %err, "failed to apply fallback poll interval");
        }
    }
    if old.preferred_source != new.preferred_source {
        let preferred = AggregatorConfig::from_app_config(new).preferred_source;
        if let Err(err) = aggregator.set_preferred_source(preferred) {
            error!(error = %err, "failed to apply preferred source");
        }
    }

    let needs_restart = old.source_priority != new.source_priority
        || old.selection != new.selection
        || old.poll_push_sources != new.poll_push_sources
        || old.tolerances != new.tolerances
        || old.intervals.backend_poll_ms != new.intervals.backend_poll_ms
        || old.log_level != new.log_level;
    if needs_restart {
        warn!("some configuration changes take effect only after a restart");
    }
}

/// Opens every reachable source behind a fresh aggregator and gives them a
/// moment to report their first snapshot.
async fn warm_aggregator(cfg: &AppConfig) -> Aggregator {
    let sources = build_sources(&cfg.source_priority, backend_poll(cfg)).await;
    let aggregator = Aggregator::new(AggregatorConfig::from_app_config(cfg), sources);
    tokio::time::sleep(WARMUP).await;
    aggregator.settle().await;
    aggregator
}

async fn status(cfg: &AppConfig, json: bool) -> Result<()> {
    let aggregator = warm_aggregator(cfg).await;
    let np = aggregator.now_playing();
    aggregator.stop().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&np)?);
        return Ok(());
    }

    let now = SystemTime::now();
    println!(
        "source: {}",
        np.source.as_ref().map(SourceId::as_str).unwrap_or("<none>")
    );
    println!("state: {}", describe_state(&np.state, now));
    match np.track {
        Some(track) => {
            println!("track: {}", describe_track(&track));
            if let Some(album) = track.album {
                println!("album: {album}");
            }
        }
        None => println!("track: <none>"),
    }

    Ok(())
}

async fn list_sources(cfg: &AppConfig) -> Result<()> {
    let ids = available_source_ids(&cfg.source_priority).await;
    if ids.is_empty() {
        println!("no sources available on this system");
        return Ok(());
    }

    let opened: Vec<Arc<dyn Source>> = ids
        .iter()
        .filter_map(|id| open_source(id, backend_poll(cfg)))
        .collect();
    tokio::time::sleep(WARMUP).await;

    let now = SystemTime::now();
    for source in &opened {
        let track = source
            .current_track()
            .map(|t| describe_track(&t))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<28} {:<8} {:<20} {}",
            source.id().as_str(),
            if source.is_alive() { "alive" } else { "gone" },
            describe_state(&source.current_state(), now),
            track
        );
    }
    Ok(())
}

async fn control(cfg: &AppConfig, action: ControlAction, source: Option<String>) -> Result<()> {
    let command = action.to_command()?;
    let aggregator = warm_aggregator(cfg).await;

    if let Some(source) = source {
        let id = SourceId::new(source);
        if !aggregator.source_ids().contains(&id) {
            aggregator.stop().await;
            bail!("source `{id}` is not available");
        }
        aggregator.set_preferred_source(Some(id))?;
        aggregator.settle().await;
    }

    let Some(target) = aggregator.current_source() else {
        aggregator.stop().await;
        bail!("no active player to control");
    };

    aggregator.command(command);
    aggregator.settle().await;
    // the command runs on the source's own worker
    tokio::time::sleep(WARMUP).await;
    aggregator.settle().await;

    println!("{target}: {}", describe(&aggregator.now_playing(), SystemTime::now()));
    aggregator.stop().await;
    Ok(())
}

async fn doctor(cfg_path: &Path, cfg: Result<AppConfig>) -> Result<()> {
    println!("== nowplaying doctor ==");
    println!("Config file: {}", cfg_path.display());

    let cfg = match cfg {
        Ok(cfg) => {
            println!("Config: ok");
            cfg
        }
        Err(err) => {
            println!("Config: invalid ({err:#}); using defaults");
            AppConfig::default()
        }
    };
    println!("Source priority: {}", cfg.source_priority.join(", "));

    let ids = available_source_ids(&cfg.source_priority).await;
    if ids.is_empty() {
        println!("No sources reachable");
    }

    let opened: Vec<Arc<dyn Source>> = ids
        .iter()
        .filter_map(|id| open_source(id, backend_poll(&cfg)))
        .collect();
    tokio::time::sleep(WARMUP).await;

    for source in &opened {
        println!(
            "Source {} ({:?}): {}",
            source.id(),
            source.app(),
            if source.is_alive() { "alive" } else { "not running" }
        );
        if let Some(err) = source.last_error() {
            println!("  last error: {err}");
        }
    }

    #[cfg(target_os = "macos")]
    {
        println!(
            "macOS automation: verify System Settings > Privacy & Security > Automation allows Terminal (or your shell) to control Music"
        );
    }

    #[cfg(target_os = "linux")]
    {
        if std::env::var_os("DBUS_SESSION_BUS_ADDRESS").is_none() {
            println!("DBUS_SESSION_BUS_ADDRESS is not set; MPRIS players cannot be reached");
        }
    }

    Ok(())
}

fn describe(np: &NowPlaying, now: SystemTime) -> String {
    let Some(source) = &np.source else {
        return "idle".to_string();
    };
    let track = np
        .track
        .as_ref()
        .map(describe_track)
        .unwrap_or_else(|| "<no track>".to_string());
    format!("[{source}] {} {track}", describe_state(&np.state, now))
}

fn describe_track(track: &Track) -> String {
    let name = match (&track.artist, &track.title) {
        (Some(artist), Some(title)) => format!("{artist} - {title}"),
        (None, Some(title)) => title.clone(),
        _ => track.id.clone(),
    };
    match track.duration {
        Some(duration) => format!("{name} ({})", format_clock(duration)),
        None => name,
    }
}

fn describe_state(state: &PlaybackState, now: SystemTime) -> String {
    match state {
        PlaybackState::Stopped => state.label().to_string(),
        _ => format!("{} @ {}", state.label(), format_clock(state.elapsed(now))),
    }
}

fn format_clock(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3_600 {
        format!("{}:{:02}:{:02}", secs / 3_600, (secs / 60) % 60, secs % 60)
    } else {
        format!("{}:{:02}", secs / 60, secs % 60)
    }
}

fn id_strings(ids: &[SourceId]) -> Vec<&str> {
    ids.iter().map(SourceId::as_str).collect()
}

fn backend_poll(cfg: &AppConfig) -> Duration {
    Duration::from_millis(cfg.intervals.backend_poll_ms)
}

fn default_config_path() -> PathBuf {
    let base = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join("nowplaying").join("config.toml")
}

fn init_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory {}", parent.display()))?;
    }
    let cfg = AppConfig::default();
    let toml = toml::to_string_pretty(&cfg)?;
    std::fs::write(path, toml)
        .with_context(|| format!("failed to write config file {}", path.display()))?;
    Ok(())
}

fn load_or_default(path: &Path) -> Result<AppConfig> {
    let mut cfg = if !path.exists() {
        AppConfig::default()
    } else {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&data).with_context(|| format!("failed to parse {}", path.display()))?
    };
    apply_env_overrides(&mut cfg);
    cfg.validate()
        .with_context(|| format!("invalid configuration in {}", path.display()))?;
    Ok(cfg)
}

fn init_logging(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // stdout carries the feed itself
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn spawn_reload_watchers(path: PathBuf, poll_ms: u64, tx: mpsc::Sender<()>) -> Result<()> {
    let tx_poll = tx.clone();
    tokio::spawn(async move {
        let mut known_mtime = file_mtime(&path);
        let sleep = Duration::from_millis(poll_ms.max(2_000));
        loop {
            tokio::time::sleep(sleep).await;
            let current = file_mtime(&path);
            if current.is_some() && current != known_mtime {
                known_mtime = current;
                let _ = tx_poll.send(()).await;
            }
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let tx_hup = tx.clone();
        tokio::spawn(async move {
            if let Ok(mut sig) = signal(SignalKind::hangup()) {
                while sig.recv().await.is_some() {
                    let _ = tx_hup.send(()).await;
                }
            }
        });
    }

    Ok(())
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).ok()?.modified().ok()
}

fn apply_env_overrides(cfg: &mut AppConfig) {
    if let Ok(v) = std::env::var("NOWPLAYING_LOG_LEVEL") {
        if !v.trim().is_empty() {
            cfg.log_level = v;
        }
    }
    if let Ok(v) = std::env::var("NOWPLAYING_PREFERRED_SOURCE") {
        let v = v.trim();
        cfg.preferred_source = if v.is_empty() { None } else { Some(v.to_string()) };
    }
    if let Ok(v) = std::env::var("NOWPLAYING_FALLBACK_POLL_MS") {
        if let Ok(parsed) = v.trim().parse::<u64>() {
            cfg.intervals.fallback_poll_ms = parsed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{describe, describe_track, format_clock, Cli, Commands, ControlAction};
    use clap::Parser;
    use nowplaying_core::{PlaybackState, SourceId, Track};
    use nowplaying_engine::NowPlaying;
    use nowplaying_sources::Command;
    use std::time::{Duration, SystemTime};

    #[test]
    fn clock_formatting() {
        assert_eq!(format_clock(Duration::from_secs(7)), "0:07");
        assert_eq!(format_clock(Duration::from_secs(185)), "3:05");
        assert_eq!(format_clock(Duration::from_secs(3_725)), "1:02:05");
    }

    #[test]
    fn describes_now_playing() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(10_000);
        assert_eq!(describe(&NowPlaying::default(), now), "idle");

        let np = NowPlaying {
            source: Some(SourceId::new("mpris:vlc")),
            track: Some(
                Track::new("t1")
                    .with_artist("Band")
                    .with_title("Song")
                    .with_duration(Duration::from_secs(200)),
            ),
            state: PlaybackState::playing_at(Duration::from_secs(65), now),
        };
        assert_eq!(describe(&np, now), "[mpris:vlc] playing @ 1:05 Band - Song (3:20)");
    }

    #[test]
    fn track_without_metadata_falls_back_to_id() {
        assert_eq!(describe_track(&Track::new("spotify:track:1")), "spotify:track:1");
    }

    #[test]
    fn control_arguments_map_to_commands() {
        let cli = Cli::try_parse_from(["nowplaying", "control", "seek", "42.5", "--source", "windows"]).unwrap();
        match cli.command {
            Some(Commands::Control { action, source }) => {
                assert_eq!(action.to_command().unwrap(), Command::Seek(Duration::from_millis(42_500)));
                assert_eq!(source.as_deref(), Some("windows"));
            }
            other => panic!("unexpected command {other:?}"),
        }

        assert_eq!(ControlAction::Toggle.to_command().unwrap(), Command::PlayPause);
        assert!(ControlAction::Seek { seconds: -1.0 }.to_command().is_err());
    }

    #[test]
    fn status_json_flag_parses() {
        let cli = Cli::try_parse_from(["nowplaying", "status", "--json"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Status { json: true })));
    }
}
