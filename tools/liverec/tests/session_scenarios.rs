use liverec::api::{FakeLiveApi, LiveApi};
use liverec::config::{session_settings, AccountConfig, ApiConfig, AppConfig};
use liverec::errors::{ApiError, LiverecError};
use liverec::runtime::{
    FakeArtifact, FakeClock, FakeFileSystem, FakeProcessRunner, FakeTerminal, FileSystem,
    ProcessOutput, ProductionRuntime, StopSignal,
};
use liverec::segments::{Finalized, MIN_SEGMENT_BYTES};
use liverec::session::{Session, SessionDeps, SessionEvent, SessionExit};
use liverec::types::{LiveStatus, RecordingMode, SessionState};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

struct World {
    api: FakeLiveApi,
    clock: FakeClock,
    fs: FakeFileSystem,
    runner: FakeProcessRunner,
    stop: StopSignal,
}

impl World {
    fn new() -> Self {
        let fs = FakeFileSystem::default();
        Self {
            api: FakeLiveApi::new(),
            clock: FakeClock::default(),
            runner: FakeProcessRunner::with_file_system(fs.clone()),
            fs,
            stop: StopSignal::new(),
        }
    }

    fn session(&self) -> Session {
        self.session_combining(true)
    }

    fn session_combining(&self, combine: bool) -> Session {
        let mut cfg = AppConfig::default();
        cfg.output.directory = PathBuf::from("/recordings");
        cfg.output.combine = combine;
        let account = AccountConfig {
            user_id: "alice".to_string(),
            room_id: None,
            output_dir: None,
            format: None,
            interval_seconds: None,
        };
        let deps = SessionDeps {
            api: Arc::new(self.api.clone()),
            clock: Arc::new(self.clock.clone()),
            fs: Arc::new(self.fs.clone()),
            runner: Arc::new(self.runner.clone()),
        };
        Session::new(
            session_settings(&cfg, &account),
            &cfg.recorder,
            false,
            deps,
            self.stop.clone(),
        )
    }

    fn runtime(&self, terminal: &FakeTerminal) -> ProductionRuntime {
        ProductionRuntime {
            clock: Arc::new(self.clock.clone()),
            file_system: Arc::new(self.fs.clone()),
            process_runner: Arc::new(self.runner.clone()),
            terminal: Arc::new(terminal.clone()),
        }
    }
}

fn ffmpeg_exit(code: i32, stderr: &str) -> ProcessOutput {
    ProcessOutput {
        exit_code: code,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

fn secs(values: &[u64]) -> Vec<Duration> {
    values.iter().copied().map(Duration::from_secs).collect()
}

fn args(values: &[&str]) -> Vec<OsString> {
    std::iter::once("liverec")
        .chain(values.iter().copied())
        .map(OsString::from)
        .collect()
}

#[test]
fn lagging_broadcast_is_concatenated_into_one_file_when_it_ends() {
    let world = World::new();
    world.api.push_statuses(&[
        LiveStatus::Offline,
        LiveStatus::Offline,
        LiveStatus::Live,
        LiveStatus::Live,
        LiveStatus::Offline,
    ]);
    world.runner.push_run(
        Ok(ffmpeg_exit(1, "frame=  10 fps=30\nStream ends prematurely")),
        FakeArtifact::Bytes(2 * MIN_SEGMENT_BYTES),
    );
    world.runner.push_run(
        Ok(ffmpeg_exit(0, "frame=  90 fps=30")),
        FakeArtifact::Bytes(3 * MIN_SEGMENT_BYTES),
    );
    world
        .runner
        .push_run(Ok(ffmpeg_exit(0, "")), FakeArtifact::ConcatOfList);
    world.clock.raise_after_sleeps(5, world.stop.clone());

    let mut session = world.session();
    let mut events = Vec::new();
    let exit = session
        .run(&mut |event| events.push(event.clone()))
        .expect("run");

    assert_eq!(exit, SessionExit::Stopped);
    assert_eq!(world.clock.sleep_durations(), secs(&[10, 10, 5, 5, 10]));

    let spawned = world.runner.spawned();
    assert_eq!(spawned.len(), 3);
    assert!(spawned[2].args.iter().any(|arg| arg == "concat"));

    let concatenated = events
        .iter()
        .find_map(|event| match event {
            SessionEvent::Finalized(Finalized::Concatenated {
                output,
                bytes,
                sources,
            }) => Some((output.clone(), *bytes, sources.len())),
            _ => None,
        })
        .expect("concatenated");
    assert_eq!(concatenated.1, 5 * MIN_SEGMENT_BYTES);
    assert_eq!(concatenated.2, 2);
    assert!(concatenated
        .0
        .to_string_lossy()
        .contains("[tiktok][alice]owner-of-room-1_concat.ts"));
    assert_eq!(world.fs.paths(), vec![concatenated.0]);
}

#[test]
fn lagging_broadcast_keeps_separate_files_without_combine() {
    let world = World::new();
    world
        .api
        .push_statuses(&[LiveStatus::Live, LiveStatus::Live, LiveStatus::Offline]);
    world.runner.push_run(
        Ok(ffmpeg_exit(1, "frame=  10 fps=30\nStream ends prematurely")),
        FakeArtifact::Bytes(2 * MIN_SEGMENT_BYTES),
    );
    world.runner.push_run(
        Ok(ffmpeg_exit(0, "frame=  90 fps=30")),
        FakeArtifact::Bytes(3 * MIN_SEGMENT_BYTES),
    );
    world.clock.raise_after_sleeps(3, world.stop.clone());

    let mut session = world.session_combining(false);
    let mut events = Vec::new();
    let exit = session
        .run(&mut |event| events.push(event.clone()))
        .expect("run");

    assert_eq!(exit, SessionExit::Stopped);
    assert_eq!(world.runner.spawned().len(), 2);
    let kept = events
        .iter()
        .find_map(|event| match event {
            SessionEvent::Finalized(Finalized::Separate(segments)) => Some(segments.clone()),
            _ => None,
        })
        .expect("separate");
    assert_eq!(kept.len(), 2);
    let mut paths = kept
        .iter()
        .map(|segment| segment.path.clone())
        .collect::<Vec<_>>();
    paths.sort();
    assert_eq!(world.fs.paths(), paths);
    assert!(session.pending_segments().is_empty());
}

#[test]
fn a_broadcast_enters_live_once_before_recording() {
    let world = World::new();
    world
        .api
        .push_statuses(&[LiveStatus::Live, LiveStatus::Live, LiveStatus::Offline]);
    for _ in 0..2 {
        world.runner.push_run(
            Ok(ffmpeg_exit(1, "frame=  10 fps=30\nStream ends prematurely")),
            FakeArtifact::Bytes(MIN_SEGMENT_BYTES),
        );
    }
    world
        .runner
        .push_run(Ok(ffmpeg_exit(0, "")), FakeArtifact::ConcatOfList);
    world.clock.raise_after_sleeps(3, world.stop.clone());

    let mut session = world.session();
    let mut events = Vec::new();
    session
        .run(&mut |event| events.push(event.clone()))
        .expect("run");

    let live_entries = events
        .iter()
        .filter(|event| {
            matches!(
                event,
                SessionEvent::StateChanged {
                    to: SessionState::Live,
                    ..
                }
            )
        })
        .count();
    assert_eq!(live_entries, 1);

    let entered_live = events
        .iter()
        .position(|event| {
            matches!(
                event,
                SessionEvent::StateChanged {
                    to: SessionState::Live,
                    ..
                }
            )
        })
        .expect("live");
    let first_recording = events
        .iter()
        .position(|event| matches!(event, SessionEvent::RecordingStarted { .. }))
        .expect("recording started");
    assert!(entered_live < first_recording);
    assert_eq!(world.api.count_calls("resolve_display_name"), 1);
}

#[test]
fn blacklisted_account_escalates_and_stops() {
    let world = World::new();
    world
        .api
        .push_room(Err(ApiError::Blacklisted("redirected".to_string())));

    let mut session = world.session();
    let err = session.run(&mut |_| {}).expect_err("escalates");

    assert!(matches!(err, LiverecError::Api(ApiError::Blacklisted(_))));
    assert_eq!(session.state(), SessionState::Stopped);
    assert!(world.clock.sleeps().is_empty());
}

#[test]
fn missing_recorder_program_escalates() {
    let world = World::new();
    world.api.push_statuses(&[LiveStatus::Live]);
    world
        .runner
        .push_spawn_error(LiverecError::ProcessMissing("ffmpeg".to_string()));

    let mut session = world.session();
    let err = session.run(&mut |_| {}).expect_err("escalates");

    assert!(matches!(err, LiverecError::ProcessMissing(program) if program == "ffmpeg"));
    assert_eq!(session.state(), SessionState::Stopped);
    assert!(world.runner.waits().is_empty());
}

#[test]
fn stop_during_recording_keeps_the_partial_segment() {
    let world = World::new();
    world.api.push_statuses(&[LiveStatus::Live]);
    world.runner.raise_stop_during_next_wait(world.stop.clone());
    world.runner.push_run(
        Ok(ffmpeg_exit(255, "frame= 400 fps=30")),
        FakeArtifact::Bytes(4 * MIN_SEGMENT_BYTES),
    );

    let mut session = world.session();
    let mut events = Vec::new();
    let exit = session
        .run(&mut |event| events.push(event.clone()))
        .expect("run");

    assert_eq!(exit, SessionExit::Stopped);
    assert!(world.clock.sleeps().is_empty());
    let single = events
        .iter()
        .find_map(|event| match event {
            SessionEvent::Finalized(Finalized::Single(segment)) => Some(segment.clone()),
            _ => None,
        })
        .expect("single segment");
    assert_eq!(single.size_bytes, 4 * MIN_SEGMENT_BYTES);
    assert!(world.fs.exists(&single.path));
    assert!(session.pending_segments().is_empty());
}

#[test]
fn manual_run_reports_each_account_and_exits_zero() {
    let world = World::new();
    world.fs.write_string(
        Path::new("/work/liverec.toml"),
        include_str!("fixtures/configs/two-accounts.toml"),
    )
    .expect("seed config");
    let terminal = FakeTerminal::new(false);
    let runtime = world.runtime(&terminal);
    let logs = tempfile::tempdir().expect("tempdir");
    let api = world.api.clone();
    let factory = move |_: &ApiConfig| -> Result<Arc<dyn LiveApi>, LiverecError> {
        Ok(Arc::new(api.clone()))
    };

    let code = liverec::run_with_runtime(
        &args(&[
            "--config",
            "liverec.toml",
            "--log-dir",
            &logs.path().display().to_string(),
        ]),
        Path::new("/work"),
        &runtime,
        &factory,
        &world.stop,
    )
    .expect("run");

    assert_eq!(code, 0);
    let lines = terminal.written_lines();
    assert_eq!(
        lines[0],
        "watching 2 account(s) in manual mode, recordings go to /work/recordings"
    );
    for user in ["alice", "bob"] {
        let expected = format!("session={user} state=offline message=is offline ");
        assert!(lines.contains(&expected), "missing {expected:?} in {lines:?}");
    }
    assert!(world
        .fs
        .created_dirs()
        .contains(&PathBuf::from("/work/recordings")));
    assert!(world.runner.spawned().is_empty());
}

#[test]
fn escalated_session_fails_the_run() {
    let world = World::new();
    world
        .api
        .push_room(Err(ApiError::Blacklisted("redirected".to_string())));
    let terminal = FakeTerminal::new(false);
    let runtime = world.runtime(&terminal);
    let logs = tempfile::tempdir().expect("tempdir");
    let api = world.api.clone();
    let factory = move |_: &ApiConfig| -> Result<Arc<dyn LiveApi>, LiverecError> {
        Ok(Arc::new(api.clone()))
    };

    let err = liverec::run_with_runtime(
        &args(&[
            "--user",
            "@alice",
            "--output-dir",
            "/out",
            "--log-dir",
            &logs.path().display().to_string(),
        ]),
        Path::new("/work"),
        &runtime,
        &factory,
        &world.stop,
    )
    .expect_err("escalated");

    assert!(matches!(err, LiverecError::Api(ApiError::Blacklisted(_))));
    assert!(world.stop.is_raised());
    assert!(terminal
        .written_lines()
        .iter()
        .any(|line| line.starts_with("session=alice state=stopped message=blacklisted")));
}

#[test]
fn session_settings_follow_per_account_overrides() {
    let mut cfg = AppConfig::default();
    cfg.output.directory = PathBuf::from("/recordings");
    cfg.execution.mode = RecordingMode::Manual;
    let account = AccountConfig {
        user_id: "@bob".to_string(),
        room_id: None,
        output_dir: Some(PathBuf::from("/bob")),
        format: Some("mp4".to_string()),
        interval_seconds: Some(30),
    };
    let settings = session_settings(&cfg, &account);
    assert_eq!(settings.user_id, "bob");
    assert_eq!(settings.output_dir, PathBuf::from("/bob"));
    assert_eq!(settings.format, "mp4");
    assert_eq!(settings.poll_interval, Duration::from_secs(30));
    assert_eq!(settings.mode, RecordingMode::Manual);
}
