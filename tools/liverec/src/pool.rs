use crate::config::{session_settings, AppConfig};
use crate::errors::LiverecError;
use crate::logging::{append_run_log, structured_fallback_line};
use crate::runtime::{StopSignal, Terminal};
use crate::segments::Finalized;
use crate::session::{Session, SessionDeps, SessionEvent, SessionExit};
use crate::types::{RecordingOutcome, SessionState};
use serde_json::json;
use std::collections::HashMap;
use std::thread;
use tokio::sync::mpsc;

const REPORT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
pub enum PoolMessage {
    Event {
        user_id: String,
        event: SessionEvent,
    },
    Finished {
        user_id: String,
        result: Result<SessionExit, LiverecError>,
    },
}

#[derive(Debug, Default)]
pub struct PoolSummary {
    pub exits: Vec<(String, SessionExit)>,
}

/// Runs one session per configured account, each on its own thread, and
/// renders their events from the calling thread. Returns the first
/// escalated error once every session has ended.
pub fn run_session_pool(
    cfg: &AppConfig,
    deps: SessionDeps,
    stop: StopSignal,
    terminal: &dyn Terminal,
) -> Result<PoolSummary, LiverecError> {
    let has_authenticated_fallback = cfg.api.cookies.is_some();
    let (tx, mut rx) = mpsc::channel::<PoolMessage>(REPORT_CHANNEL_CAPACITY);

    let mut handles = Vec::with_capacity(cfg.accounts.len());
    for account in &cfg.accounts {
        let settings = session_settings(cfg, account);
        let user_id = settings.user_id.clone();
        let recorder = cfg.recorder.clone();
        let deps = deps.clone();
        let stop = stop.clone();
        let tx = tx.clone();
        let handle = thread::Builder::new()
            .name(format!("session-{user_id}"))
            .spawn(move || {
                let mut session =
                    Session::new(settings, &recorder, has_authenticated_fallback, deps, stop);
                let result = session.run(&mut |event| {
                    let _ = tx.blocking_send(PoolMessage::Event {
                        user_id: user_id.clone(),
                        event: event.clone(),
                    });
                });
                let _ = tx.blocking_send(PoolMessage::Finished { user_id, result });
            })
            .map_err(|e| LiverecError::Io(e.to_string()))?;
        handles.push(handle);
    }
    drop(tx);

    let mut states: HashMap<String, SessionState> = HashMap::new();
    let mut summary = PoolSummary::default();
    let mut first_error: Option<LiverecError> = None;
    while let Some(message) = rx.blocking_recv() {
        match message {
            PoolMessage::Event { user_id, event } => {
                if let SessionEvent::StateChanged { to, .. } = &event {
                    states.insert(user_id.clone(), *to);
                }
                let state = states.get(&user_id).copied().unwrap_or(SessionState::Init);
                if let Err(err) = render_event(terminal, &user_id, state, &event) {
                    log_render_failure(&user_id, &err);
                }
            }
            PoolMessage::Finished { user_id, result } => match result {
                Ok(exit) => summary.exits.push((user_id, exit)),
                Err(err) => {
                    append_run_log(
                        "error",
                        "pool.session_failed",
                        json!({ "user_id": user_id, "error": err.to_string() }),
                    );
                    if let Err(write_err) = terminal.write_line(&structured_fallback_line(
                        &user_id,
                        SessionState::Stopped.as_str(),
                        &err.to_string(),
                    )) {
                        log_render_failure(&user_id, &write_err);
                    }
                    if cfg.execution.abort_on_escalation {
                        stop.raise();
                    }
                    first_error.get_or_insert(err);
                }
            },
        }
    }

    for handle in handles {
        if handle.join().is_err() {
            first_error.get_or_insert(LiverecError::Process(
                "session thread panicked".to_string(),
            ));
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(summary),
    }
}

fn log_render_failure(user_id: &str, err: &LiverecError) {
    append_run_log(
        "warn",
        "pool.render_failed",
        json!({ "user_id": user_id, "error": err.to_string() }),
    );
}

pub fn render_event(
    terminal: &dyn Terminal,
    user_id: &str,
    state: SessionState,
    event: &SessionEvent,
) -> Result<(), LiverecError> {
    if let SessionEvent::Progress(line) = event {
        if terminal.stdout_is_tty() {
            terminal.write_progress(&format!("[{user_id}] {line}"))?;
        }
        return Ok(());
    }
    let Some(message) = describe_event(event) else {
        return Ok(());
    };
    if terminal.stdout_is_tty() {
        terminal.write_line(&format!("[{user_id}] {message}"))
    } else {
        terminal.write_line(&structured_fallback_line(user_id, state.as_str(), &message))
    }
}

pub fn describe_event(event: &SessionEvent) -> Option<String> {
    match event {
        SessionEvent::StateChanged { to, .. } => match to {
            SessionState::Live => Some("is live".to_string()),
            SessionState::Offline => Some("is offline".to_string()),
            _ => None,
        },
        SessionEvent::Resolved {
            room_id,
            display_name,
        } => Some(format!("username {display_name}, room id {room_id}")),
        SessionEvent::RecordingStarted { output } => {
            Some(format!("started recording to {}", output.display()))
        }
        SessionEvent::Progress(_) | SessionEvent::Waiting(_) => None,
        SessionEvent::RecordingFinished { outcome, .. } => Some(match outcome {
            RecordingOutcome::Completed(bytes) => format!("recording ended ({bytes} bytes)"),
            RecordingOutcome::Lagging => "stream lagging".to_string(),
            RecordingOutcome::FatalError(message) => format!("ffmpeg error: {message}"),
            RecordingOutcome::ProcessMissing => "ffmpeg is not installed".to_string(),
        }),
        SessionEvent::SegmentKept(segment) => Some(format!(
            "kept segment {} ({} bytes)",
            segment.path.display(),
            segment.size_bytes
        )),
        SessionEvent::SegmentDiscarded(segment) => Some(format!(
            "discarded segment under 1 MiB: {}",
            segment.path.display()
        )),
        SessionEvent::Finalized(finalized) => match finalized {
            Finalized::Nothing => None,
            Finalized::Single(segment) => {
                Some(format!("recording finished: {}", segment.path.display()))
            }
            Finalized::Separate(segments) => Some(format!(
                "recording finished in {} separate files",
                segments.len()
            )),
            Finalized::Concatenated {
                output, sources, ..
            } => Some(format!(
                "concatenated {} segments into {}",
                sources.len(),
                output.display()
            )),
            Finalized::ConcatFailed { reason, retained } => Some(format!(
                "concat failed ({reason}); kept {} segments",
                retained.len()
            )),
        },
        SessionEvent::RetryScheduled { message, .. } => Some(message.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::{describe_event, render_event, run_session_pool};
    use crate::api::FakeLiveApi;
    use crate::config::{AccountConfig, AppConfig};
    use crate::errors::LiverecError;
    use crate::runtime::{
        FakeClock, FakeFileSystem, FakeProcessRunner, FakeTerminal, StopSignal, Terminal,
    };
    use crate::session::{SessionDeps, SessionEvent, SessionExit};
    use crate::types::{RecordingMode, SessionState};
    use std::sync::Arc;
    use std::time::Duration;

    struct BrokenTerminal;

    impl Terminal for BrokenTerminal {
        fn stdout_is_tty(&self) -> bool {
            false
        }

        fn write_line(&self, _line: &str) -> Result<(), LiverecError> {
            Err(LiverecError::Io("broken pipe".to_string()))
        }

        fn write_progress(&self, _line: &str) -> Result<(), LiverecError> {
            Err(LiverecError::Io("broken pipe".to_string()))
        }
    }

    #[test]
    fn terminal_failures_do_not_abandon_running_sessions() {
        let mut cfg = AppConfig::default();
        cfg.execution.mode = RecordingMode::Manual;
        cfg.accounts = ["alice", "bob"]
            .iter()
            .map(|user| AccountConfig {
                user_id: user.to_string(),
                room_id: None,
                output_dir: None,
                format: None,
                interval_seconds: None,
            })
            .collect();
        let fs = FakeFileSystem::default();
        let deps = SessionDeps {
            api: Arc::new(FakeLiveApi::new()),
            clock: Arc::new(FakeClock::default()),
            fs: Arc::new(fs.clone()),
            runner: Arc::new(FakeProcessRunner::with_file_system(fs)),
        };
        let stop = StopSignal::new();

        let summary =
            run_session_pool(&cfg, deps, stop.clone(), &BrokenTerminal).expect("pool");
        let mut exits = summary.exits;
        exits.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            exits,
            vec![
                ("alice".to_string(), SessionExit::NotLive),
                ("bob".to_string(), SessionExit::NotLive),
            ]
        );
        assert!(!stop.is_raised());
    }

    #[test]
    fn non_tty_output_uses_structured_lines_and_skips_progress() {
        let terminal = FakeTerminal::new(false);
        render_event(
            &terminal,
            "alice",
            SessionState::Live,
            &SessionEvent::Progress("frame=1".to_string()),
        )
        .expect("progress");
        render_event(
            &terminal,
            "alice",
            SessionState::Live,
            &SessionEvent::StateChanged {
                from: SessionState::Offline,
                to: SessionState::Live,
            },
        )
        .expect("state");

        assert_eq!(
            terminal.written_lines(),
            vec!["session=alice state=live message=is live ".to_string()]
        );
        assert!(terminal.progress_lines().is_empty());
    }

    #[test]
    fn tty_output_rewrites_progress_in_place() {
        let terminal = FakeTerminal::new(true);
        render_event(
            &terminal,
            "bob",
            SessionState::Live,
            &SessionEvent::Progress("frame=2".to_string()),
        )
        .expect("progress");
        assert_eq!(terminal.progress_lines(), vec!["[bob] frame=2".to_string()]);
    }

    #[test]
    fn poll_waits_are_silent() {
        assert_eq!(
            describe_event(&SessionEvent::Waiting(Duration::from_secs(10))),
            None
        );
    }
}
