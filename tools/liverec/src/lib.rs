pub mod api;
pub mod classifier;
pub mod config;
pub mod errors;
pub mod fsm;
pub mod log_retention;
pub mod logging;
pub mod pool;
pub mod retry;
pub mod runtime;
pub mod segments;
pub mod session;
pub mod signals;
pub mod supervisor;
pub mod types;

use api::{LiveApi, TikTokApi};
use clap::{error::ErrorKind, Parser, ValueEnum};
use config::{
    account_label, load_config, ApiConfig, AppConfig, CliOverrides, DEFAULT_TOR_PROXY,
};
use errors::LiverecError;
use log_retention::RetentionPolicy;
use logging::{append_run_log, init_run_logger, JsonlLogger};
use pool::run_session_pool;
use runtime::{ProductionRuntime, StopSignal};
use serde_json::json;
use session::SessionDeps;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use types::RecordingMode;

#[derive(Debug, Clone, Parser)]
#[command(name = "liverec", version)]
#[command(about = "Watch live-streaming accounts and record every broadcast with ffmpeg")]
pub struct Cli {
    /// TOML config file.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Account to watch; repeat for several. Replaces [[accounts]].
    #[arg(long = "user", short = 'u')]
    pub users: Vec<String>,
    /// Room to watch directly, skipping the user lookup; repeat for several.
    #[arg(long = "room-id")]
    pub room_ids: Vec<String>,
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
    /// Container extension for recordings, e.g. ts or mp4.
    #[arg(long)]
    pub format: Option<String>,
    /// Seconds between offline polls.
    #[arg(long)]
    pub interval: Option<u64>,
    /// Stop each recording after this many seconds.
    #[arg(long)]
    pub duration: Option<u64>,
    /// Route API requests through a proxy. The bare flag uses local Tor.
    #[arg(long, num_args = 0..=1, default_missing_value = DEFAULT_TOR_PROXY)]
    pub proxy: Option<String>,
    /// Cookie header sent with API requests, for private or age-gated rooms.
    #[arg(long)]
    pub cookies: Option<String>,
    #[arg(long, value_enum)]
    pub mode: Option<CliMode>,
    /// Move concatenated sources into a `_parts` folder instead of deleting them.
    #[arg(long, default_value_t = false)]
    pub keep_originals: bool,
    /// Join a broadcast's segments into one file when it ends (the default).
    #[arg(long, overrides_with = "no_combine")]
    pub combine: bool,
    /// Keep every segment of a broadcast as its own file.
    #[arg(long, overrides_with = "combine")]
    pub no_combine: bool,
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CliMode {
    Manual,
    Auto,
}

impl Cli {
    fn combine_override(&self) -> Option<bool> {
        match (self.combine, self.no_combine) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        }
    }
}

impl From<CliMode> for RecordingMode {
    fn from(value: CliMode) -> Self {
        match value {
            CliMode::Manual => RecordingMode::Manual,
            CliMode::Auto => RecordingMode::Automatic,
        }
    }
}

pub type ApiFactory<'a> = &'a dyn Fn(&ApiConfig) -> Result<Arc<dyn LiveApi>, LiverecError>;

pub fn run() -> Result<i32, LiverecError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let cwd = std::env::current_dir().map_err(|e| LiverecError::Io(e.to_string()))?;
    let runtime = ProductionRuntime::new();
    let stop = StopSignal::new();
    signals::spawn_shutdown_watcher(stop.clone())?;
    let factory = |cfg: &ApiConfig| -> Result<Arc<dyn LiveApi>, LiverecError> {
        Ok(Arc::new(TikTokApi::new(cfg)?))
    };
    run_with_runtime(&args, &cwd, &runtime, &factory, &stop)
}

pub fn run_with_runtime(
    args: &[OsString],
    cwd: &Path,
    runtime: &ProductionRuntime,
    api_factory: ApiFactory<'_>,
    stop: &StopSignal,
) -> Result<i32, LiverecError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{error}");
                return Ok(0);
            }
            _ => return Err(LiverecError::Cli(error.to_string())),
        },
    };

    let overrides = CliOverrides {
        config_path: cli.config.clone(),
        users: cli.users.clone(),
        room_ids: cli.room_ids.clone(),
        output_dir: cli.output_dir.clone(),
        format: cli.format.clone(),
        interval_seconds: cli.interval,
        duration_seconds: cli.duration,
        proxy: cli.proxy.clone(),
        cookies: cli.cookies.clone(),
        mode: cli.mode.map(Into::into),
        keep_originals: cli.keep_originals,
        combine: cli.combine_override(),
        log_dir: cli.log_dir.clone(),
    };
    let cfg = load_config(&overrides, cwd, runtime.file_system.as_ref())?;
    start_run_log(&cfg, runtime)?;

    let api = api_factory(&cfg.api)?;
    runtime.file_system.create_dir_all(&cfg.output.directory)?;
    runtime.terminal.write_line(&format!(
        "watching {} account(s) in {} mode, recordings go to {}",
        cfg.accounts.len(),
        cfg.execution.mode.as_str(),
        cfg.output.directory.display()
    ))?;

    let deps = SessionDeps {
        api,
        clock: runtime.clock.clone(),
        fs: runtime.file_system.clone(),
        runner: runtime.process_runner.clone(),
    };
    let summary = match run_session_pool(&cfg, deps, stop.clone(), runtime.terminal.as_ref()) {
        Ok(summary) => summary,
        Err(err) => {
            append_run_log("error", "run.failed", json!({ "error": err.to_string() }));
            return Err(err);
        }
    };

    append_run_log(
        "info",
        "run.finished",
        json!({
            "sessions": summary.exits.len(),
            "exits": summary
                .exits
                .iter()
                .map(|(user, exit)| format!("{user}={}", exit.as_str()))
                .collect::<Vec<_>>(),
        }),
    );
    Ok(0)
}

fn start_run_log(cfg: &AppConfig, runtime: &ProductionRuntime) -> Result<(), LiverecError> {
    let mut logger = JsonlLogger::new(&cfg.logging.directory);
    logger.retention = RetentionPolicy {
        budget_bytes: cfg.logging.budget_bytes,
        max_age_days: cfg.logging.retention_days,
    };
    if let Err(err) = init_run_logger(logger) {
        runtime
            .terminal
            .write_line(&format!("run log disabled: {err}"))?;
        return Ok(());
    }
    append_run_log(
        "info",
        "run.started",
        json!({
            "accounts": cfg
                .accounts
                .iter()
                .map(account_label)
                .collect::<Vec<_>>(),
            "mode": cfg.execution.mode.as_str(),
            "output_dir": cfg.output.directory.display().to_string(),
            "proxy": cfg.api.proxy.is_some(),
            "cookies": cfg.api.cookies.is_some(),
            "combine": cfg.output.combine,
        }),
    );
    Ok(())
}
