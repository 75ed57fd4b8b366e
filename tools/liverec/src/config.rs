use crate::errors::LiverecError;
use crate::logging::{DEFAULT_DISK_BUDGET_BYTES, DEFAULT_RETENTION_DAYS};
use crate::runtime::FileSystem;
use crate::types::{RecordingMode, RoomId};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";
pub const DEFAULT_TOR_PROXY: &str = "socks5://127.0.0.1:9050";

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub users: Vec<String>,
    pub room_ids: Vec<String>,
    pub output_dir: Option<PathBuf>,
    pub format: Option<String>,
    pub interval_seconds: Option<u64>,
    pub duration_seconds: Option<u64>,
    pub proxy: Option<String>,
    pub cookies: Option<String>,
    pub mode: Option<RecordingMode>,
    pub keep_originals: bool,
    pub combine: Option<bool>,
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub output: OutputConfig,
    pub polling: PollingConfig,
    pub recorder: RecorderConfig,
    pub api: ApiConfig,
    pub logging: LoggingConfig,
    pub execution: ExecutionConfig,
    pub accounts: Vec<AccountConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputConfig {
    pub directory: PathBuf,
    pub format: String,
    pub keep_originals: bool,
    /// Join a broadcast's segments into one file when it ends.
    pub combine: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PollingConfig {
    pub interval_seconds: u64,
    pub lag_wait_seconds: u64,
    pub error_wait_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecorderConfig {
    pub program: String,
    pub max_duration_seconds: Option<u64>,
    pub reconnect_delay_max_seconds: u64,
    pub timeout_microseconds: u64,
    pub extra_lag_signatures: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiConfig {
    pub platform: String,
    pub user_agent: String,
    pub proxy: Option<String>,
    pub cookies: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub directory: PathBuf,
    pub retention_days: u64,
    pub budget_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionConfig {
    pub mode: RecordingMode,
    pub abort_on_escalation: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountConfig {
    #[serde(default)]
    pub user_id: String,
    /// Watch this room directly instead of resolving it from `user_id`.
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub interval_seconds: Option<u64>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            output: OutputConfig {
                directory: PathBuf::from("output"),
                format: "ts".to_string(),
                keep_originals: false,
                combine: true,
            },
            polling: PollingConfig {
                interval_seconds: 10,
                lag_wait_seconds: 5,
                error_wait_seconds: 120,
            },
            recorder: RecorderConfig {
                program: "ffmpeg".to_string(),
                max_duration_seconds: None,
                reconnect_delay_max_seconds: 5,
                timeout_microseconds: 10_000_000,
                extra_lag_signatures: Vec::new(),
            },
            api: ApiConfig {
                platform: "tiktok".to_string(),
                user_agent: DEFAULT_USER_AGENT.to_string(),
                proxy: None,
                cookies: None,
            },
            logging: LoggingConfig {
                directory: PathBuf::from("logs"),
                retention_days: DEFAULT_RETENTION_DAYS,
                budget_bytes: DEFAULT_DISK_BUDGET_BYTES,
            },
            execution: ExecutionConfig {
                mode: RecordingMode::Automatic,
                abort_on_escalation: true,
            },
            accounts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PartialAppConfig {
    output: Option<PartialOutputConfig>,
    polling: Option<PartialPollingConfig>,
    recorder: Option<PartialRecorderConfig>,
    api: Option<PartialApiConfig>,
    logging: Option<PartialLoggingConfig>,
    execution: Option<PartialExecutionConfig>,
    accounts: Option<Vec<AccountConfig>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialOutputConfig {
    directory: Option<PathBuf>,
    format: Option<String>,
    keep_originals: Option<bool>,
    combine: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialPollingConfig {
    interval_seconds: Option<u64>,
    lag_wait_seconds: Option<u64>,
    error_wait_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialRecorderConfig {
    program: Option<String>,
    max_duration_seconds: Option<u64>,
    reconnect_delay_max_seconds: Option<u64>,
    timeout_microseconds: Option<u64>,
    extra_lag_signatures: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialApiConfig {
    platform: Option<String>,
    user_agent: Option<String>,
    proxy: Option<String>,
    cookies: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialLoggingConfig {
    directory: Option<PathBuf>,
    retention_days: Option<u64>,
    budget_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialExecutionConfig {
    mode: Option<RecordingMode>,
    abort_on_escalation: Option<bool>,
}

/// Everything one session needs, with paths already absolutized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub user_id: String,
    pub output_dir: PathBuf,
    pub format: String,
    pub poll_interval: Duration,
    pub lag_wait: Duration,
    pub error_wait: Duration,
    pub max_duration: Option<Duration>,
    pub keep_originals: bool,
    pub combine: bool,
    pub mode: RecordingMode,
    pub platform: String,
    /// Fixed room for accounts configured by room id.
    pub room_id: Option<RoomId>,
}

pub fn load_config(
    overrides: &CliOverrides,
    process_cwd: &Path,
    fs: &dyn FileSystem,
) -> Result<AppConfig, LiverecError> {
    let mut cfg = AppConfig::default();

    if let Some(path) = &overrides.config_path {
        let path = absolutize_path(process_cwd, path);
        let file_contents = fs.read_to_string(&path)?;
        let partial: PartialAppConfig = toml::from_str(&file_contents)
            .map_err(|e| LiverecError::ConfigParse(e.to_string()))?;
        merge_partial_config(&mut cfg, partial);
    }

    apply_cli_overrides(&mut cfg, overrides);
    absolutize_config_paths(&mut cfg, process_cwd);
    validate_config(&cfg)?;
    Ok(cfg)
}

fn merge_partial_config(cfg: &mut AppConfig, partial: PartialAppConfig) {
    if let Some(output) = partial.output {
        if let Some(directory) = output.directory {
            cfg.output.directory = directory;
        }
        if let Some(format) = output.format {
            cfg.output.format = format;
        }
        if let Some(keep_originals) = output.keep_originals {
            cfg.output.keep_originals = keep_originals;
        }
        if let Some(combine) = output.combine {
            cfg.output.combine = combine;
        }
    }

    if let Some(polling) = partial.polling {
        if let Some(value) = polling.interval_seconds {
            cfg.polling.interval_seconds = value;
        }
        if let Some(value) = polling.lag_wait_seconds {
            cfg.polling.lag_wait_seconds = value;
        }
        if let Some(value) = polling.error_wait_seconds {
            cfg.polling.error_wait_seconds = value;
        }
    }

    if let Some(recorder) = partial.recorder {
        if let Some(program) = recorder.program {
            cfg.recorder.program = program;
        }
        if recorder.max_duration_seconds.is_some() {
            cfg.recorder.max_duration_seconds = recorder.max_duration_seconds;
        }
        if let Some(value) = recorder.reconnect_delay_max_seconds {
            cfg.recorder.reconnect_delay_max_seconds = value;
        }
        if let Some(value) = recorder.timeout_microseconds {
            cfg.recorder.timeout_microseconds = value;
        }
        if let Some(signatures) = recorder.extra_lag_signatures {
            cfg.recorder.extra_lag_signatures = signatures;
        }
    }

    if let Some(api) = partial.api {
        if let Some(platform) = api.platform {
            cfg.api.platform = platform;
        }
        if let Some(user_agent) = api.user_agent {
            cfg.api.user_agent = user_agent;
        }
        if api.proxy.is_some() {
            cfg.api.proxy = api.proxy;
        }
        if api.cookies.is_some() {
            cfg.api.cookies = api.cookies;
        }
    }

    if let Some(logging) = partial.logging {
        if let Some(directory) = logging.directory {
            cfg.logging.directory = directory;
        }
        if let Some(value) = logging.retention_days {
            cfg.logging.retention_days = value;
        }
        if let Some(value) = logging.budget_bytes {
            cfg.logging.budget_bytes = value;
        }
    }

    if let Some(execution) = partial.execution {
        if let Some(mode) = execution.mode {
            cfg.execution.mode = mode;
        }
        if let Some(value) = execution.abort_on_escalation {
            cfg.execution.abort_on_escalation = value;
        }
    }

    if let Some(accounts) = partial.accounts {
        cfg.accounts = accounts;
    }
}

fn apply_cli_overrides(cfg: &mut AppConfig, overrides: &CliOverrides) {
    if !overrides.users.is_empty() || !overrides.room_ids.is_empty() {
        let by_user = overrides.users.iter().map(|user_id| AccountConfig {
            user_id: user_id.clone(),
            room_id: None,
            output_dir: None,
            format: None,
            interval_seconds: None,
        });
        let by_room = overrides.room_ids.iter().map(|room_id| AccountConfig {
            user_id: String::new(),
            room_id: Some(room_id.clone()),
            output_dir: None,
            format: None,
            interval_seconds: None,
        });
        cfg.accounts = by_user.chain(by_room).collect();
    }
    if let Some(output_dir) = &overrides.output_dir {
        cfg.output.directory = output_dir.clone();
    }
    if let Some(format) = &overrides.format {
        cfg.output.format = format.clone();
    }
    if let Some(interval) = overrides.interval_seconds {
        cfg.polling.interval_seconds = interval;
    }
    if let Some(duration) = overrides.duration_seconds {
        cfg.recorder.max_duration_seconds = Some(duration);
    }
    if let Some(proxy) = &overrides.proxy {
        cfg.api.proxy = Some(proxy.clone());
    }
    if let Some(cookies) = &overrides.cookies {
        cfg.api.cookies = Some(cookies.clone());
    }
    if let Some(mode) = overrides.mode {
        cfg.execution.mode = mode;
    }
    if overrides.keep_originals {
        cfg.output.keep_originals = true;
    }
    if let Some(combine) = overrides.combine {
        cfg.output.combine = combine;
    }
    if let Some(log_dir) = &overrides.log_dir {
        cfg.logging.directory = log_dir.clone();
    }
}

fn absolutize_config_paths(cfg: &mut AppConfig, process_cwd: &Path) {
    cfg.output.directory = absolutize_path(process_cwd, &cfg.output.directory);
    cfg.logging.directory = absolutize_path(process_cwd, &cfg.logging.directory);
    for account in &mut cfg.accounts {
        if let Some(dir) = &account.output_dir {
            account.output_dir = Some(absolutize_path(process_cwd, dir));
        }
    }
}

fn absolutize_path(base: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        base.join(value)
    }
}

/// Strips surrounding whitespace and the leading `@` users often paste.
pub fn normalize_user_id(raw: &str) -> String {
    raw.trim().trim_start_matches('@').to_string()
}

/// Name a session goes by: the user id, or `room-<id>` for room-only accounts.
pub fn account_label(account: &AccountConfig) -> String {
    let user_id = normalize_user_id(&account.user_id);
    match &account.room_id {
        Some(room_id) if user_id.is_empty() => format!("room-{}", room_id.trim()),
        _ => user_id,
    }
}

fn validate_config(cfg: &AppConfig) -> Result<(), LiverecError> {
    if cfg.accounts.is_empty() {
        return Err(LiverecError::InvalidConfig(
            "at least one account is required (use --user, --room-id or [[accounts]])".to_string(),
        ));
    }
    if cfg.polling.interval_seconds == 0 {
        return Err(LiverecError::InvalidConfig(
            "polling.interval_seconds must be greater than zero".to_string(),
        ));
    }
    if cfg.output.format.trim().is_empty() {
        return Err(LiverecError::InvalidConfig(
            "output.format must not be empty".to_string(),
        ));
    }
    if cfg.recorder.program.trim().is_empty() {
        return Err(LiverecError::InvalidConfig(
            "recorder.program must not be empty".to_string(),
        ));
    }
    if cfg.api.platform != "tiktok" {
        return Err(LiverecError::InvalidConfig(format!(
            "api.platform `{}` is not supported",
            cfg.api.platform
        )));
    }
    for account in &cfg.accounts {
        match &account.room_id {
            Some(room_id) => {
                let room_id = room_id.trim();
                if room_id.is_empty() || !room_id.chars().all(|c| c.is_ascii_digit()) {
                    return Err(LiverecError::InvalidConfig(format!(
                        "accounts.room_id `{room_id}` must be numeric"
                    )));
                }
            }
            None => {
                if normalize_user_id(&account.user_id).is_empty() {
                    return Err(LiverecError::InvalidConfig(
                        "accounts need a user_id or a room_id".to_string(),
                    ));
                }
            }
        }
        let label = account_label(account);
        if account.interval_seconds == Some(0) {
            return Err(LiverecError::InvalidConfig(format!(
                "accounts.interval_seconds for `{label}` must be greater than zero"
            )));
        }
        if let Some(format) = &account.format {
            if format.trim().is_empty() {
                return Err(LiverecError::InvalidConfig(format!(
                    "accounts.format for `{label}` must not be empty"
                )));
            }
        }
    }
    Ok(())
}

pub fn session_settings(cfg: &AppConfig, account: &AccountConfig) -> SessionSettings {
    SessionSettings {
        user_id: account_label(account),
        output_dir: account
            .output_dir
            .clone()
            .unwrap_or_else(|| cfg.output.directory.clone()),
        format: account
            .format
            .clone()
            .unwrap_or_else(|| cfg.output.format.clone()),
        poll_interval: Duration::from_secs(
            account
                .interval_seconds
                .unwrap_or(cfg.polling.interval_seconds),
        ),
        lag_wait: Duration::from_secs(cfg.polling.lag_wait_seconds),
        error_wait: Duration::from_secs(cfg.polling.error_wait_seconds),
        max_duration: cfg.recorder.max_duration_seconds.map(Duration::from_secs),
        keep_originals: cfg.output.keep_originals,
        combine: cfg.output.combine,
        mode: cfg.execution.mode,
        platform: cfg.api.platform.clone(),
        room_id: account
            .room_id
            .as_deref()
            .map(|room_id| RoomId::new(room_id.trim())),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        account_label, load_config, normalize_user_id, session_settings, AppConfig, CliOverrides,
    };
    use crate::errors::LiverecError;
    use crate::runtime::FakeFileSystem;
    use crate::types::{RecordingMode, RoomId};
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    fn user_overrides(user: &str) -> CliOverrides {
        CliOverrides {
            users: vec![user.to_string()],
            ..CliOverrides::default()
        }
    }

    #[test]
    fn defaults_match_recorder_conventions() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.output.format, "ts");
        assert_eq!(cfg.polling.interval_seconds, 10);
        assert_eq!(cfg.polling.lag_wait_seconds, 5);
        assert_eq!(cfg.polling.error_wait_seconds, 120);
        assert_eq!(cfg.recorder.timeout_microseconds, 10_000_000);
        assert_eq!(cfg.logging.retention_days, 3);
        assert_eq!(cfg.execution.mode, RecordingMode::Automatic);
        assert!(cfg.output.combine);
    }

    #[test]
    fn file_overlay_merges_field_by_field_and_cli_wins() {
        let fs = FakeFileSystem::with_file(
            "/work/liverec.toml",
            r#"
[output]
format = "mp4"

[polling]
interval_seconds = 30

[recorder]
extra_lag_signatures = ["Connection reset by peer"]

[execution]
mode = "manual"

[[accounts]]
user_id = "@alice"
interval_seconds = 45
"#,
        );
        let overrides = CliOverrides {
            config_path: Some(PathBuf::from("liverec.toml")),
            format: Some("mkv".to_string()),
            ..CliOverrides::default()
        };

        let cfg = load_config(&overrides, Path::new("/work"), &fs).expect("config");
        assert_eq!(cfg.output.format, "mkv");
        assert_eq!(cfg.polling.interval_seconds, 30);
        assert_eq!(cfg.polling.lag_wait_seconds, 5);
        assert_eq!(cfg.execution.mode, RecordingMode::Manual);
        assert_eq!(cfg.output.directory, PathBuf::from("/work/output"));
        assert_eq!(
            cfg.recorder.extra_lag_signatures,
            vec!["Connection reset by peer".to_string()]
        );

        let settings = session_settings(&cfg, &cfg.accounts[0]);
        assert_eq!(settings.user_id, "alice");
        assert_eq!(settings.poll_interval, Duration::from_secs(45));
        assert_eq!(settings.format, "mkv");
    }

    #[test]
    fn cli_users_replace_configured_accounts() {
        let fs = FakeFileSystem::with_file(
            "/work/liverec.toml",
            "[[accounts]]\nuser_id = \"alice\"\n",
        );
        let overrides = CliOverrides {
            config_path: Some(PathBuf::from("/work/liverec.toml")),
            users: vec!["bob".to_string(), "carol".to_string()],
            ..CliOverrides::default()
        };
        let cfg = load_config(&overrides, Path::new("/work"), &fs).expect("config");
        let users = cfg
            .accounts
            .iter()
            .map(|a| a.user_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(users, vec!["bob", "carol"]);
    }

    #[test]
    fn missing_accounts_is_invalid() {
        let fs = FakeFileSystem::default();
        let err = load_config(&CliOverrides::default(), Path::new("/work"), &fs)
            .expect_err("no accounts");
        assert!(matches!(err, LiverecError::InvalidConfig(_)));
    }

    #[test]
    fn zero_interval_and_blank_user_are_invalid() {
        let fs = FakeFileSystem::default();
        let mut overrides = user_overrides("alice");
        overrides.interval_seconds = Some(0);
        assert!(matches!(
            load_config(&overrides, Path::new("/work"), &fs),
            Err(LiverecError::InvalidConfig(_))
        ));

        assert!(matches!(
            load_config(&user_overrides("@"), Path::new("/work"), &fs),
            Err(LiverecError::InvalidConfig(_))
        ));
    }

    #[test]
    fn unknown_sections_are_parse_errors() {
        let fs = FakeFileSystem::with_file("/work/bad.toml", "[orchestrator]\nparallelism = 2\n");
        let overrides = CliOverrides {
            config_path: Some(PathBuf::from("/work/bad.toml")),
            ..user_overrides("alice")
        };
        assert!(matches!(
            load_config(&overrides, Path::new("/work"), &fs),
            Err(LiverecError::ConfigParse(_))
        ));
    }

    #[test]
    fn normalize_strips_at_sign_and_whitespace() {
        assert_eq!(normalize_user_id("  @someone "), "someone");
        assert_eq!(normalize_user_id("plain"), "plain");
    }

    #[test]
    fn room_id_accounts_pin_their_room() {
        let fs = FakeFileSystem::with_file(
            "/work/liverec.toml",
            "[output]\ncombine = false\n\n[[accounts]]\nroom_id = \"7301\"\n",
        );
        let overrides = CliOverrides {
            config_path: Some(PathBuf::from("/work/liverec.toml")),
            ..CliOverrides::default()
        };
        let cfg = load_config(&overrides, Path::new("/work"), &fs).expect("config");
        assert!(!cfg.output.combine);
        assert_eq!(account_label(&cfg.accounts[0]), "room-7301");

        let settings = session_settings(&cfg, &cfg.accounts[0]);
        assert_eq!(settings.user_id, "room-7301");
        assert_eq!(settings.room_id, Some(RoomId::new("7301")));
        assert!(!settings.combine);
    }

    #[test]
    fn cli_room_ids_join_users_and_combine_flag_overrides_file() {
        let fs = FakeFileSystem::with_file("/work/liverec.toml", "[output]\ncombine = false\n");
        let overrides = CliOverrides {
            config_path: Some(PathBuf::from("/work/liverec.toml")),
            users: vec!["alice".to_string()],
            room_ids: vec!["42".to_string()],
            combine: Some(true),
            ..CliOverrides::default()
        };
        let cfg = load_config(&overrides, Path::new("/work"), &fs).expect("config");
        assert!(cfg.output.combine);
        let labels = cfg.accounts.iter().map(account_label).collect::<Vec<_>>();
        assert_eq!(labels, vec!["alice".to_string(), "room-42".to_string()]);
    }

    #[test]
    fn non_numeric_room_id_is_invalid() {
        let fs = FakeFileSystem::default();
        let overrides = CliOverrides {
            room_ids: vec!["abc".to_string()],
            ..CliOverrides::default()
        };
        let err = load_config(&overrides, Path::new("/work"), &fs).expect_err("invalid room");
        assert!(err.to_string().contains("must be numeric"));
    }
}
