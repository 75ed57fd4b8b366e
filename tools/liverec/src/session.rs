use crate::api::LiveApi;
use crate::config::{RecorderConfig, SessionSettings};
use crate::errors::{ApiError, LiverecError};
use crate::fsm::FsmSnapshot;
use crate::logging::append_run_log;
use crate::retry::{describe_wait, RetryCause, RetryPolicy};
use crate::runtime::{Clock, FileSystem, ProcessRunner, StopSignal, Wake};
use crate::segments::{
    generate_filename, recording_flag, unique_path, Finalized, SegmentDisposition, SegmentStore,
};
use crate::supervisor::{RecordingSignal, RecordingSupervisor};
use crate::types::{LiveStatus, RecordingMode, RecordingOutcome, RoomId, SegmentRef, SessionState};
use chrono::{DateTime, Local};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct SessionDeps {
    pub api: Arc<dyn LiveApi>,
    pub clock: Arc<dyn Clock>,
    pub fs: Arc<dyn FileSystem>,
    pub runner: Arc<dyn ProcessRunner>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    Resolved {
        room_id: RoomId,
        display_name: String,
    },
    RecordingStarted {
        output: PathBuf,
    },
    Progress(String),
    RecordingFinished {
        output: PathBuf,
        outcome: RecordingOutcome,
    },
    SegmentKept(SegmentRef),
    SegmentDiscarded(SegmentRef),
    Finalized(Finalized),
    RetryScheduled {
        cause: RetryCause,
        message: String,
        wait: Duration,
    },
    Waiting(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExit {
    /// Operator stop.
    Stopped,
    /// Manual mode found the account offline on its first status check.
    NotLive,
    /// Manual mode finished its one broadcast.
    Recorded,
}

impl SessionExit {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::NotLive => "not_live",
            Self::Recorded => "recorded",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Finished(SessionExit),
}

/// One monitored account. `poll_once` runs a single check, decide, act and
/// wait cycle; `run` repeats it until the session finishes or escalates.
pub struct Session {
    settings: SessionSettings,
    deps: SessionDeps,
    stop: StopSignal,
    policy: RetryPolicy,
    supervisor: RecordingSupervisor,
    segments: SegmentStore,
    fsm: FsmSnapshot,
    program: String,
    room_id: Option<RoomId>,
    display_name: Option<String>,
    last_title: Option<String>,
    status_polls: u32,
    recorded_since_finalize: bool,
}

impl Session {
    pub fn new(
        settings: SessionSettings,
        recorder: &RecorderConfig,
        has_authenticated_fallback: bool,
        deps: SessionDeps,
        stop: StopSignal,
    ) -> Self {
        let policy = RetryPolicy::from_settings(&settings, has_authenticated_fallback);
        let supervisor =
            RecordingSupervisor::new(deps.fs.clone(), deps.runner.clone(), recorder);
        let segments = SegmentStore::new(
            deps.fs.clone(),
            deps.runner.clone(),
            recorder.program.clone(),
            settings.output_dir.clone(),
            settings.format.clone(),
            settings.keep_originals,
        )
        .with_combine(settings.combine);
        Self {
            settings,
            deps,
            stop,
            policy,
            supervisor,
            segments,
            fsm: FsmSnapshot::default(),
            program: recorder.program.clone(),
            room_id: None,
            display_name: None,
            last_title: None,
            status_polls: 0,
            recorded_since_finalize: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.fsm.state
    }

    pub fn room_id(&self) -> Option<&RoomId> {
        self.room_id.as_ref()
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn pending_segments(&self) -> &[SegmentRef] {
        self.segments.segments()
    }

    pub fn run(
        &mut self,
        on_event: &mut dyn FnMut(&SessionEvent),
    ) -> Result<SessionExit, LiverecError> {
        append_run_log(
            "info",
            "session.started",
            json!({
                "user_id": self.settings.user_id,
                "mode": self.settings.mode.as_str(),
                "output_dir": self.settings.output_dir.display().to_string(),
                "poll_interval_seconds": self.settings.poll_interval.as_secs(),
            }),
        );
        loop {
            if let Flow::Finished(exit) = self.poll_once(on_event)? {
                append_run_log(
                    "info",
                    "session.finished",
                    json!({ "user_id": self.settings.user_id, "exit": exit.as_str() }),
                );
                return Ok(exit);
            }
        }
    }

    pub fn poll_once(
        &mut self,
        on_event: &mut dyn FnMut(&SessionEvent),
    ) -> Result<Flow, LiverecError> {
        if self.fsm.is_terminal() {
            return Ok(Flow::Finished(SessionExit::Stopped));
        }
        if self.stop.is_raised() {
            return self.finish_stopped(on_event);
        }

        if self.room_id.is_none() {
            if self.fsm.state == SessionState::Init {
                self.change_state(SessionState::Resolving, on_event)?;
            }
            if let Err(err) = self.resolve(on_event) {
                return self.handle_api_error("resolve", err, on_event);
            }
        }
        let Some(room_id) = self.room_id.clone() else {
            return Ok(Flow::Continue);
        };

        let status = match self.deps.api.get_live_status(&room_id) {
            Ok(status) => status,
            Err(err) => return self.handle_api_error("status", err, on_event),
        };
        self.status_polls = self.status_polls.saturating_add(1);

        match status {
            LiveStatus::Offline => self.on_offline(on_event),
            LiveStatus::Unknown => self.handle_error(
                "status",
                RetryCause::UnknownStatus,
                LiverecError::Api(ApiError::Transient("live status unknown".to_string())),
                on_event,
            ),
            LiveStatus::Live => self.on_live(room_id, on_event),
        }
    }

    fn resolve(&mut self, on_event: &mut dyn FnMut(&SessionEvent)) -> Result<(), ApiError> {
        let room_id = match &self.settings.room_id {
            Some(pinned) => pinned.clone(),
            None => self.deps.api.resolve_room_id(&self.settings.user_id)?,
        };
        let first_resolution = self.display_name.is_none();
        if first_resolution {
            let name = self.deps.api.resolve_display_name(&room_id)?;
            self.display_name = Some(name);
        }
        let display_name = self
            .display_name
            .clone()
            .unwrap_or_else(|| self.settings.user_id.clone());
        if first_resolution {
            append_run_log(
                "info",
                "session.resolved",
                json!({
                    "user_id": self.settings.user_id,
                    "username": display_name,
                    "room_id": room_id,
                }),
            );
        }
        on_event(&SessionEvent::Resolved {
            room_id: room_id.clone(),
            display_name,
        });
        self.room_id = Some(room_id);
        Ok(())
    }

    fn on_offline(&mut self, on_event: &mut dyn FnMut(&SessionEvent)) -> Result<Flow, LiverecError> {
        let decision = self.policy.decide(RetryCause::Offline);
        if decision.clear_room_id {
            self.room_id = None;
        }
        self.change_state(SessionState::Offline, on_event)?;
        append_run_log(
            "info",
            "session.offline",
            json!({ "user_id": self.settings.user_id, "polls": self.status_polls }),
        );

        let had_recording = self.recorded_since_finalize;
        self.finalize(on_event);
        if self.settings.mode == RecordingMode::Manual {
            if had_recording {
                return self.finish(SessionExit::Recorded, on_event);
            }
            if self.status_polls == 1 {
                return self.finish(SessionExit::NotLive, on_event);
            }
        }
        self.wait(decision.wait, on_event)
    }

    fn on_live(
        &mut self,
        room_id: RoomId,
        on_event: &mut dyn FnMut(&SessionEvent),
    ) -> Result<Flow, LiverecError> {
        if self.fsm.state != SessionState::Lagging {
            self.change_state(SessionState::Live, on_event)?;
            append_run_log(
                "info",
                "session.live",
                json!({ "user_id": self.settings.user_id, "room_id": room_id }),
            );
        }

        let stream_url = match self.deps.api.get_stream_url(&room_id) {
            Ok(url) => url,
            Err(err) => return self.handle_api_error("stream_url", err, on_event),
        };
        let title = match self.deps.api.get_title(&room_id) {
            Ok(Some(title)) => title,
            Ok(None) | Err(_) => self.fallback_title(),
        };
        self.last_title = Some(title.clone());

        if let Err(err) = self.deps.fs.create_dir_all(&self.settings.output_dir) {
            return self.handle_error("record", RetryCause::Storage, err, on_event);
        }
        let now = DateTime::<Local>::from(self.deps.clock.now());
        let file_name = generate_filename(&now, &self.flag(), &title, &self.settings.format);
        let output = unique_path(self.deps.fs.as_ref(), &self.settings.output_dir, &file_name);

        let outcome = {
            let started_output = output.clone();
            let mut forward = |signal: RecordingSignal| match signal {
                RecordingSignal::Started => on_event(&SessionEvent::RecordingStarted {
                    output: started_output.clone(),
                }),
                RecordingSignal::Progress(line) => on_event(&SessionEvent::Progress(line)),
            };
            self.supervisor.supervise(
                &stream_url,
                &output,
                self.settings.max_duration,
                &self.stop,
                &mut forward,
            )
        };
        on_event(&SessionEvent::RecordingFinished {
            output: output.clone(),
            outcome: outcome.clone(),
        });

        match &outcome {
            RecordingOutcome::ProcessMissing => {
                return self.handle_error(
                    "record",
                    RetryCause::ProcessMissing,
                    LiverecError::ProcessMissing(self.program.clone()),
                    on_event,
                );
            }
            RecordingOutcome::FatalError(message) => append_run_log(
                "error",
                "recording.failed",
                json!({
                    "user_id": self.settings.user_id,
                    "room_id": room_id,
                    "phase": "record",
                    "error": message,
                }),
            ),
            RecordingOutcome::Lagging => append_run_log(
                "info",
                "recording.lagging",
                json!({ "user_id": self.settings.user_id, "room_id": room_id }),
            ),
            RecordingOutcome::Completed(bytes) => append_run_log(
                "info",
                "recording.completed",
                json!({ "user_id": self.settings.user_id, "bytes": bytes }),
            ),
        }

        // Every finished recording is treated as a possible stall.
        self.change_state(SessionState::Lagging, on_event)?;
        self.recorded_since_finalize = true;
        self.keep_or_discard(output, on_event);

        let decision = self.policy.decide(RetryCause::Lagging);
        self.wait(decision.wait, on_event)
    }

    fn keep_or_discard(&mut self, output: PathBuf, on_event: &mut dyn FnMut(&SessionEvent)) {
        if !self.deps.fs.exists(&output) {
            return;
        }
        let size_bytes = match self.deps.fs.file_size(&output) {
            Ok(size_bytes) => size_bytes,
            Err(err) => {
                // Left on disk outside the store rather than risk deleting a full recording.
                append_run_log(
                    "warn",
                    "session.segment_size_unknown",
                    json!({
                        "user_id": self.settings.user_id,
                        "path": output.display().to_string(),
                        "error": err.to_string(),
                    }),
                );
                return;
            }
        };
        let segment = SegmentRef {
            path: output,
            size_bytes,
        };
        match self.segments.record(segment.clone()) {
            SegmentDisposition::Kept => on_event(&SessionEvent::SegmentKept(segment)),
            SegmentDisposition::Discarded => on_event(&SessionEvent::SegmentDiscarded(segment)),
        }
    }

    fn handle_api_error(
        &mut self,
        phase: &str,
        err: ApiError,
        on_event: &mut dyn FnMut(&SessionEvent),
    ) -> Result<Flow, LiverecError> {
        let cause = RetryCause::Api(err.kind());
        self.handle_error(phase, cause, LiverecError::Api(err), on_event)
    }

    fn handle_error(
        &mut self,
        phase: &str,
        cause: RetryCause,
        err: LiverecError,
        on_event: &mut dyn FnMut(&SessionEvent),
    ) -> Result<Flow, LiverecError> {
        let decision = self.policy.decide(cause);
        let room_id = self.room_id.clone();
        if decision.clear_room_id {
            self.room_id = None;
        }

        if decision.escalate {
            append_run_log(
                "error",
                "session.escalated",
                json!({
                    "user_id": self.settings.user_id,
                    "room_id": room_id,
                    "phase": phase,
                    "cause": cause.as_str(),
                    "error": err.to_string(),
                }),
            );
            self.finalize(on_event);
            self.change_state(SessionState::Stopped, on_event)?;
            return Err(err);
        }

        let message = format!("{err}. {}", describe_wait(decision.wait));
        append_run_log(
            "warn",
            "session.retry",
            json!({
                "user_id": self.settings.user_id,
                "room_id": room_id,
                "phase": phase,
                "state": self.fsm.state.as_str(),
                "cause": cause.as_str(),
                "error": err.to_string(),
                "wait_seconds": decision.wait.as_secs(),
            }),
        );
        on_event(&SessionEvent::RetryScheduled {
            cause,
            message,
            wait: decision.wait,
        });
        self.wait(decision.wait, on_event)
    }

    fn wait(
        &mut self,
        wait: Duration,
        on_event: &mut dyn FnMut(&SessionEvent),
    ) -> Result<Flow, LiverecError> {
        on_event(&SessionEvent::Waiting(wait));
        let deadline = self.deps.clock.now() + wait;
        match self.deps.clock.sleep_until(deadline, &self.stop)? {
            Wake::Elapsed => Ok(Flow::Continue),
            Wake::Stopped => self.finish_stopped(on_event),
        }
    }

    fn finish_stopped(
        &mut self,
        on_event: &mut dyn FnMut(&SessionEvent),
    ) -> Result<Flow, LiverecError> {
        append_run_log(
            "info",
            "session.stop_requested",
            json!({
                "user_id": self.settings.user_id,
                "pending_segments": self.segments.segments().len(),
            }),
        );
        self.finalize(on_event);
        self.finish(SessionExit::Stopped, on_event)
    }

    fn finish(
        &mut self,
        exit: SessionExit,
        on_event: &mut dyn FnMut(&SessionEvent),
    ) -> Result<Flow, LiverecError> {
        self.change_state(SessionState::Stopped, on_event)?;
        Ok(Flow::Finished(exit))
    }

    fn finalize(&mut self, on_event: &mut dyn FnMut(&SessionEvent)) {
        if self.segments.is_empty() {
            self.recorded_since_finalize = false;
            return;
        }
        let title = self
            .last_title
            .clone()
            .unwrap_or_else(|| self.fallback_title());
        let now = DateTime::<Local>::from(self.deps.clock.now());
        let result = self.segments.finalize(&self.flag(), &title, &now);
        self.recorded_since_finalize = false;
        on_event(&SessionEvent::Finalized(result));
    }

    fn change_state(
        &mut self,
        next: SessionState,
        on_event: &mut dyn FnMut(&SessionEvent),
    ) -> Result<(), LiverecError> {
        let from = self.fsm.state;
        if self.fsm.transition(next)? {
            append_run_log(
                "debug",
                "session.state_changed",
                json!({
                    "user_id": self.settings.user_id,
                    "from": from.as_str(),
                    "to": next.as_str(),
                }),
            );
            on_event(&SessionEvent::StateChanged { from, to: next });
        }
        Ok(())
    }

    fn flag(&self) -> String {
        let account = match (&self.settings.room_id, &self.display_name) {
            (Some(_), Some(name)) => name.as_str(),
            _ => self.settings.user_id.as_str(),
        };
        recording_flag(&self.settings.platform, account)
    }

    fn fallback_title(&self) -> String {
        self.display_name
            .clone()
            .unwrap_or_else(|| self.settings.user_id.clone())
    }
}
