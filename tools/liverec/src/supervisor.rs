use crate::classifier::{DiagnosticClassifier, LineKind, Verdict};
use crate::config::RecorderConfig;
use crate::errors::LiverecError;
use crate::logging::append_run_log;
use crate::runtime::{FileSystem, ProcessRequest, ProcessRunner, StopSignal};
use crate::types::RecordingOutcome;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// What the supervisor reports while ffmpeg runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordingSignal {
    Started,
    Progress(String),
}

/// Runs one ffmpeg invocation to completion. Holds no state between calls.
pub struct RecordingSupervisor {
    fs: Arc<dyn FileSystem>,
    runner: Arc<dyn ProcessRunner>,
    classifier: DiagnosticClassifier,
    program: String,
    reconnect_delay_max_seconds: u64,
    timeout_microseconds: u64,
}

impl RecordingSupervisor {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        runner: Arc<dyn ProcessRunner>,
        recorder: &RecorderConfig,
    ) -> Self {
        Self {
            fs,
            runner,
            classifier: DiagnosticClassifier::with_extra_lag_signatures(
                &recorder.extra_lag_signatures,
            ),
            program: recorder.program.clone(),
            reconnect_delay_max_seconds: recorder.reconnect_delay_max_seconds,
            timeout_microseconds: recorder.timeout_microseconds,
        }
    }

    pub fn with_classifier(mut self, classifier: DiagnosticClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn build_args(
        &self,
        stream_url: &str,
        output_path: &Path,
        max_duration: Option<Duration>,
    ) -> Vec<String> {
        let mut args = vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-stats".to_string(),
            "-n".to_string(),
            "-reconnect".to_string(),
            "1".to_string(),
            "-reconnect_streamed".to_string(),
            "1".to_string(),
            "-reconnect_at_eof".to_string(),
            "1".to_string(),
            "-reconnect_delay_max".to_string(),
            self.reconnect_delay_max_seconds.to_string(),
            "-timeout".to_string(),
            self.timeout_microseconds.to_string(),
            "-i".to_string(),
            stream_url.to_string(),
        ];
        if let Some(limit) = max_duration {
            args.push("-t".to_string());
            args.push(limit.as_secs().to_string());
        }
        args.push("-c".to_string());
        args.push("copy".to_string());
        args.push(output_path.display().to_string());
        args
    }

    pub fn supervise(
        &self,
        stream_url: &str,
        output_path: &Path,
        max_duration: Option<Duration>,
        stop: &StopSignal,
        on_signal: &mut dyn FnMut(RecordingSignal),
    ) -> RecordingOutcome {
        let request = ProcessRequest {
            program: self.program.clone(),
            args: self.build_args(stream_url, output_path, max_duration),
            cwd: None,
        };
        let handle = match self.runner.spawn(request) {
            Ok(handle) => handle,
            Err(LiverecError::ProcessMissing(program)) => {
                append_run_log(
                    "error",
                    "recording.program_missing",
                    json!({ "program": program }),
                );
                return RecordingOutcome::ProcessMissing;
            }
            Err(err) => return RecordingOutcome::FatalError(err.to_string()),
        };
        append_run_log(
            "info",
            "recording.spawned",
            json!({
                "handle": handle,
                "output": output_path.display().to_string(),
            }),
        );

        let mut started = false;
        let mut error_lines: Vec<String> = Vec::new();
        let waited = self
            .runner
            .wait_with_line_stream(handle, stop, &mut |line: &str| {
                match self.classifier.line_kind(line) {
                    LineKind::Progress => {
                        if !started {
                            started = true;
                            append_run_log(
                                "info",
                                "recording.started",
                                json!({ "output": output_path.display().to_string() }),
                            );
                            on_signal(RecordingSignal::Started);
                        }
                        on_signal(RecordingSignal::Progress(line.trim().to_string()));
                    }
                    LineKind::Diagnostic => error_lines.push(line.to_string()),
                }
            });
        let output = match waited {
            Ok(output) => output,
            Err(err) => return RecordingOutcome::FatalError(err.to_string()),
        };

        let outcome = self.classify_exit(&error_lines.join("\n"), output.exit_code, stop, output_path);
        append_run_log(
            "info",
            "recording.exited",
            json!({
                "exit_code": output.exit_code,
                "outcome": outcome.as_str(),
                "stopped": stop.is_raised(),
                "error_lines": error_lines.len(),
            }),
        );
        outcome
    }

    fn classify_exit(
        &self,
        error_buffer: &str,
        exit_code: i32,
        stop: &StopSignal,
        output_path: &Path,
    ) -> RecordingOutcome {
        match self.classifier.classify(error_buffer) {
            Some(Verdict::Lagging) => return RecordingOutcome::Lagging,
            Some(Verdict::Fatal) => return RecordingOutcome::FatalError(error_buffer.to_string()),
            None => {}
        }
        if exit_code != 0 && !stop.is_raised() {
            return RecordingOutcome::FatalError(format!("exited with status {exit_code}"));
        }
        let bytes = if self.fs.exists(output_path) {
            self.fs.file_size(output_path).unwrap_or(0)
        } else {
            0
        };
        RecordingOutcome::Completed(bytes)
    }
}
