use crate::errors::LiverecError;
use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

const STOP_POLL_TICK: Duration = Duration::from_millis(250);
const QUIT_GRACE_PERIOD: Duration = Duration::from_secs(15);

/// Process-wide operator stop request, shared by every session.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    raised: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Elapsed,
    Stopped,
}

pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
    fn sleep_until(&self, deadline: SystemTime, stop: &StopSignal) -> Result<Wake, LiverecError>;
}

pub trait ProcessRunner: Send + Sync {
    fn spawn(&self, request: ProcessRequest) -> Result<u64, LiverecError>;
    fn wait(&self, handle: u64) -> Result<ProcessOutput, LiverecError>;
    /// Waits for exit while handing each stderr line (split on `\n` or `\r`)
    /// to `on_stderr_line`. A raised `stop` asks the child to quit.
    fn wait_with_line_stream(
        &self,
        handle: u64,
        stop: &StopSignal,
        on_stderr_line: &mut dyn FnMut(&str),
    ) -> Result<ProcessOutput, LiverecError>;

    fn run(&self, request: ProcessRequest) -> Result<ProcessOutput, LiverecError> {
        let handle = self.spawn(request)?;
        self.wait(handle)
    }
}

pub trait FileSystem: Send + Sync {
    fn read_to_string(&self, path: &Path) -> Result<String, LiverecError>;
    fn write_string(&self, path: &Path, contents: &str) -> Result<(), LiverecError>;
    fn create_dir_all(&self, path: &Path) -> Result<(), LiverecError>;
    fn remove_file(&self, path: &Path) -> Result<(), LiverecError>;
    fn rename(&self, from: &Path, to: &Path) -> Result<(), LiverecError>;
    fn file_size(&self, path: &Path) -> Result<u64, LiverecError>;
    fn exists(&self, path: &Path) -> bool;
}

pub trait Terminal: Send + Sync {
    fn stdout_is_tty(&self) -> bool;
    fn write_line(&self, line: &str) -> Result<(), LiverecError>;
    /// Rewrites the current line in place.
    fn write_progress(&self, line: &str) -> Result<(), LiverecError>;
}

pub struct ProductionClock;

impl Clock for ProductionClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep_until(&self, deadline: SystemTime, stop: &StopSignal) -> Result<Wake, LiverecError> {
        loop {
            if stop.is_raised() {
                return Ok(Wake::Stopped);
            }
            let Ok(remaining) = deadline.duration_since(SystemTime::now()) else {
                return Ok(Wake::Elapsed);
            };
            if remaining.is_zero() {
                return Ok(Wake::Elapsed);
            }
            thread::sleep(remaining.min(STOP_POLL_TICK));
        }
    }
}

pub struct ProductionFileSystem;

impl FileSystem for ProductionFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, LiverecError> {
        std::fs::read_to_string(path).map_err(|e| LiverecError::Io(e.to_string()))
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), LiverecError> {
        std::fs::write(path, contents).map_err(|e| LiverecError::Io(e.to_string()))
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), LiverecError> {
        std::fs::create_dir_all(path).map_err(|e| LiverecError::Io(e.to_string()))
    }

    fn remove_file(&self, path: &Path) -> Result<(), LiverecError> {
        std::fs::remove_file(path).map_err(|e| LiverecError::Io(e.to_string()))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), LiverecError> {
        std::fs::rename(from, to).map_err(|e| LiverecError::Io(e.to_string()))
    }

    fn file_size(&self, path: &Path) -> Result<u64, LiverecError> {
        std::fs::metadata(path)
            .map(|meta| meta.len())
            .map_err(|e| LiverecError::Io(e.to_string()))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

#[derive(Default)]
struct ProcessState {
    next_handle: u64,
    children: HashMap<u64, std::process::Child>,
}

pub struct ProductionProcessRunner {
    state: Mutex<ProcessState>,
}

impl ProductionProcessRunner {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ProcessState::default()),
        }
    }

    fn take_child(&self, handle: u64) -> Result<std::process::Child, LiverecError> {
        let child = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| LiverecError::Process("process lock poisoned".to_string()))?;
            state.children.remove(&handle)
        };
        child.ok_or_else(|| LiverecError::Process(format!("unknown handle {handle}")))
    }
}

impl Default for ProductionProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRunner for ProductionProcessRunner {
    fn spawn(&self, request: ProcessRequest) -> Result<u64, LiverecError> {
        let mut cmd = std::process::Command::new(&request.program);
        cmd.args(&request.args);
        if let Some(cwd) = &request.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                LiverecError::ProcessMissing(request.program.clone())
            } else {
                LiverecError::Process(e.to_string())
            }
        })?;
        let mut state = self
            .state
            .lock()
            .map_err(|_| LiverecError::Process("process lock poisoned".to_string()))?;
        let handle = state.next_handle;
        state.next_handle += 1;
        state.children.insert(handle, child);
        Ok(handle)
    }

    fn wait(&self, handle: u64) -> Result<ProcessOutput, LiverecError> {
        let child = self.take_child(handle)?;
        let output = child
            .wait_with_output()
            .map_err(|e| LiverecError::Process(e.to_string()))?;
        Ok(ProcessOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    fn wait_with_line_stream(
        &self,
        handle: u64,
        stop: &StopSignal,
        on_stderr_line: &mut dyn FnMut(&str),
    ) -> Result<ProcessOutput, LiverecError> {
        let mut child = self.take_child(handle)?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| LiverecError::Process("child stderr was not captured".to_string()))?;
        let stdout_reader = child.stdout.take().map(|mut stdout| {
            thread::spawn(move || {
                let mut text = String::new();
                let _ = stdout.read_to_string(&mut text);
                text
            })
        });

        let (tx, rx) = mpsc::channel::<String>();
        let stderr_reader = thread::spawn(move || {
            read_diagnostic_lines(stderr, |line| tx.send(line).is_ok());
        });

        let mut collected = Vec::new();
        let mut quit_requested_at: Option<Instant> = None;
        loop {
            match rx.recv_timeout(STOP_POLL_TICK) {
                Ok(line) => {
                    on_stderr_line(&line);
                    collected.push(line);
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
            if !stop.is_raised() {
                continue;
            }
            match quit_requested_at {
                None => {
                    request_quit(&mut child);
                    quit_requested_at = Some(Instant::now());
                }
                Some(at) if at.elapsed() > QUIT_GRACE_PERIOD => {
                    let _ = child.kill();
                }
                Some(_) => {}
            }
        }

        let _ = stderr_reader.join();
        let stdout = stdout_reader
            .and_then(|reader| reader.join().ok())
            .unwrap_or_default();
        let status = child
            .wait()
            .map_err(|e| LiverecError::Process(e.to_string()))?;
        Ok(ProcessOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout,
            stderr: collected.join("\n"),
        })
    }
}

/// ffmpeg finalizes its container when it reads `q` on stdin. Stdin is
/// closed afterwards so a line-buffered reader sees the byte too.
fn request_quit(child: &mut std::process::Child) {
    let delivered = child
        .stdin
        .take()
        .map(|mut stdin| stdin.write_all(b"q").and_then(|_| stdin.flush()).is_ok())
        .unwrap_or(false);
    if !delivered {
        let _ = child.kill();
    }
}

/// Splits a byte stream on `\n` and `\r` and hands every non-empty trimmed line
/// to `emit`. Stops early when `emit` returns false.
pub fn read_diagnostic_lines<R: Read>(mut reader: R, mut emit: impl FnMut(String) -> bool) {
    let mut pending = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let read = match reader.read(&mut chunk) {
            Ok(0) | Err(_) => break,
            Ok(read) => read,
        };
        for byte in &chunk[..read] {
            if *byte == b'\n' || *byte == b'\r' {
                if !flush_line(&mut pending, &mut emit) {
                    return;
                }
            } else {
                pending.push(*byte);
            }
        }
    }
    let _ = flush_line(&mut pending, &mut emit);
}

fn flush_line(pending: &mut Vec<u8>, emit: &mut impl FnMut(String) -> bool) -> bool {
    let line = String::from_utf8_lossy(pending).trim().to_string();
    pending.clear();
    if line.is_empty() {
        return true;
    }
    emit(line)
}

pub struct ProductionTerminal;

impl Terminal for ProductionTerminal {
    fn stdout_is_tty(&self) -> bool {
        std::io::IsTerminal::is_terminal(&std::io::stdout())
    }

    fn write_line(&self, line: &str) -> Result<(), LiverecError> {
        let mut out = std::io::stdout();
        if self.stdout_is_tty() {
            crossterm::execute!(
                out,
                crossterm::cursor::MoveToColumn(0),
                crossterm::terminal::Clear(crossterm::terminal::ClearType::CurrentLine)
            )
            .map_err(|e| LiverecError::Io(e.to_string()))?;
        }
        writeln!(out, "{line}").map_err(|e| LiverecError::Io(e.to_string()))
    }

    fn write_progress(&self, line: &str) -> Result<(), LiverecError> {
        let mut out = std::io::stdout();
        crossterm::execute!(
            out,
            crossterm::cursor::MoveToColumn(0),
            crossterm::terminal::Clear(crossterm::terminal::ClearType::CurrentLine),
            crossterm::style::Print(line)
        )
        .map_err(|e| LiverecError::Io(e.to_string()))
    }
}

pub struct ProductionRuntime {
    pub clock: Arc<dyn Clock>,
    pub file_system: Arc<dyn FileSystem>,
    pub process_runner: Arc<dyn ProcessRunner>,
    pub terminal: Arc<dyn Terminal>,
}

impl ProductionRuntime {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(ProductionClock),
            file_system: Arc::new(ProductionFileSystem),
            process_runner: Arc::new(ProductionProcessRunner::new()),
            terminal: Arc::new(ProductionTerminal),
        }
    }
}

impl Default for ProductionRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct FakeClock {
    now: Arc<Mutex<SystemTime>>,
    sleeps: Arc<Mutex<Vec<SystemTime>>>,
    durations: Arc<Mutex<Vec<Duration>>>,
    raise_after: Arc<Mutex<Option<(usize, StopSignal)>>>,
}

impl FakeClock {
    pub fn new(now: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
            sleeps: Arc::new(Mutex::new(Vec::new())),
            durations: Arc::new(Mutex::new(Vec::new())),
            raise_after: Arc::new(Mutex::new(None)),
        }
    }

    pub fn sleeps(&self) -> Vec<SystemTime> {
        self.sleeps.lock().expect("sleep lock").clone()
    }

    /// Durations of every completed sleep, in order.
    pub fn sleep_durations(&self) -> Vec<Duration> {
        self.durations.lock().expect("durations lock").clone()
    }

    /// Raises `stop` once `count` sleeps have completed.
    pub fn raise_after_sleeps(&self, count: usize, stop: StopSignal) {
        *self.raise_after.lock().expect("raise lock") = Some((count, stop));
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(SystemTime::UNIX_EPOCH)
    }
}

impl Clock for FakeClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().expect("clock lock")
    }

    fn sleep_until(&self, deadline: SystemTime, stop: &StopSignal) -> Result<Wake, LiverecError> {
        if stop.is_raised() {
            return Ok(Wake::Stopped);
        }
        let completed = {
            let mut sleeps = self.sleeps.lock().expect("sleep lock");
            sleeps.push(deadline);
            sleeps.len()
        };
        {
            let mut now = self.now.lock().expect("clock lock");
            self.durations
                .lock()
                .expect("durations lock")
                .push(deadline.duration_since(*now).unwrap_or_default());
            if deadline > *now {
                *now = deadline;
            }
        }
        if let Some((count, signal)) = self.raise_after.lock().expect("raise lock").as_ref() {
            if completed >= *count {
                signal.raise();
            }
        }
        Ok(Wake::Elapsed)
    }
}

#[derive(Default, Clone)]
pub struct FakeFileSystem {
    files: Arc<Mutex<HashMap<PathBuf, String>>>,
    lens: Arc<Mutex<HashMap<PathBuf, u64>>>,
    dirs: Arc<Mutex<Vec<PathBuf>>>,
    writes: Arc<Mutex<Vec<(PathBuf, String)>>>,
    fail_next: Arc<Mutex<Option<LiverecError>>>,
    sizes_unavailable: Arc<AtomicBool>,
}

impl FakeFileSystem {
    pub fn with_file(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        let fs = Self::default();
        fs.files
            .lock()
            .expect("files lock")
            .insert(path.into(), contents.into());
        fs
    }

    /// Registers a file whose reported size is `len` without storing its bytes.
    pub fn set_file_len(&self, path: impl Into<PathBuf>, len: u64) {
        let path = path.into();
        self.files
            .lock()
            .expect("files lock")
            .entry(path.clone())
            .or_default();
        self.lens.lock().expect("lens lock").insert(path, len);
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths = self
            .files
            .lock()
            .expect("files lock")
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        paths.sort();
        paths
    }

    pub fn created_dirs(&self) -> Vec<PathBuf> {
        self.dirs.lock().expect("dirs lock").clone()
    }

    /// Every `write_string` call, including files removed since.
    pub fn writes(&self) -> Vec<(PathBuf, String)> {
        self.writes.lock().expect("writes lock").clone()
    }

    /// Every later `file_size` call fails, as with unreadable metadata.
    pub fn fail_file_sizes(&self) {
        self.sizes_unavailable.store(true, Ordering::SeqCst);
    }

    pub fn set_fail_next(&self, error: LiverecError) {
        *self.fail_next.lock().expect("fail lock") = Some(error);
    }

    fn maybe_fail(&self) -> Result<(), LiverecError> {
        if let Some(err) = self.fail_next.lock().expect("fail lock").take() {
            return Err(err);
        }
        Ok(())
    }
}

impl FileSystem for FakeFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, LiverecError> {
        self.maybe_fail()?;
        self.files
            .lock()
            .expect("files lock")
            .get(path)
            .cloned()
            .ok_or_else(|| LiverecError::Io(format!("missing file {}", path.display())))
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), LiverecError> {
        self.maybe_fail()?;
        self.writes
            .lock()
            .expect("writes lock")
            .push((path.to_path_buf(), contents.to_string()));
        self.lens.lock().expect("lens lock").remove(path);
        self.files
            .lock()
            .expect("files lock")
            .insert(path.to_path_buf(), contents.to_string());
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), LiverecError> {
        self.maybe_fail()?;
        self.dirs
            .lock()
            .expect("dirs lock")
            .push(path.to_path_buf());
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<(), LiverecError> {
        self.maybe_fail()?;
        self.lens.lock().expect("lens lock").remove(path);
        self.files
            .lock()
            .expect("files lock")
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| LiverecError::Io(format!("missing file {}", path.display())))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), LiverecError> {
        self.maybe_fail()?;
        let contents = self
            .files
            .lock()
            .expect("files lock")
            .remove(from)
            .ok_or_else(|| LiverecError::Io(format!("missing file {}", from.display())))?;
        self.files
            .lock()
            .expect("files lock")
            .insert(to.to_path_buf(), contents);
        let mut lens = self.lens.lock().expect("lens lock");
        if let Some(len) = lens.remove(from) {
            lens.insert(to.to_path_buf(), len);
        }
        Ok(())
    }

    fn file_size(&self, path: &Path) -> Result<u64, LiverecError> {
        if self.sizes_unavailable.load(Ordering::SeqCst) {
            return Err(LiverecError::Io(format!("cannot stat {}", path.display())));
        }
        if let Some(len) = self.lens.lock().expect("lens lock").get(path) {
            return Ok(*len);
        }
        self.files
            .lock()
            .expect("files lock")
            .get(path)
            .map(|contents| contents.len() as u64)
            .ok_or_else(|| LiverecError::Io(format!("missing file {}", path.display())))
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.lock().expect("files lock").contains_key(path)
    }
}

#[derive(Default, Clone)]
pub struct FakeTerminal {
    pub is_tty: bool,
    writes: Arc<Mutex<Vec<String>>>,
    progress: Arc<Mutex<Vec<String>>>,
}

impl FakeTerminal {
    pub fn new(is_tty: bool) -> Self {
        Self {
            is_tty,
            ..Self::default()
        }
    }

    pub fn written_lines(&self) -> Vec<String> {
        self.writes.lock().expect("writes lock").clone()
    }

    pub fn progress_lines(&self) -> Vec<String> {
        self.progress.lock().expect("progress lock").clone()
    }
}

impl Terminal for FakeTerminal {
    fn stdout_is_tty(&self) -> bool {
        self.is_tty
    }

    fn write_line(&self, line: &str) -> Result<(), LiverecError> {
        self.writes
            .lock()
            .expect("writes lock")
            .push(line.to_string());
        Ok(())
    }

    fn write_progress(&self, line: &str) -> Result<(), LiverecError> {
        self.progress
            .lock()
            .expect("progress lock")
            .push(line.to_string());
        Ok(())
    }
}

/// What a faked process leaves behind at its output path (the last argument).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeArtifact {
    None,
    Bytes(u64),
    /// Sums the sizes of every file named in the `-i` concat list.
    ConcatOfList,
}

struct FakeRun {
    output: Result<ProcessOutput, LiverecError>,
    artifact: FakeArtifact,
}

#[derive(Default, Clone)]
pub struct FakeProcessRunner {
    runs: Arc<Mutex<VecDeque<FakeRun>>>,
    spawn_errors: Arc<Mutex<VecDeque<LiverecError>>>,
    spawned: Arc<Mutex<Vec<ProcessRequest>>>,
    requests: Arc<Mutex<HashMap<u64, ProcessRequest>>>,
    waits: Arc<Mutex<Vec<u64>>>,
    next_handle: Arc<Mutex<u64>>,
    file_system: Option<FakeFileSystem>,
    raise_on_wait: Arc<Mutex<Option<StopSignal>>>,
}

impl FakeProcessRunner {
    /// Artifacts are written into `fs`.
    pub fn with_file_system(fs: FakeFileSystem) -> Self {
        Self {
            file_system: Some(fs),
            ..Self::default()
        }
    }

    pub fn push_run(&self, output: Result<ProcessOutput, LiverecError>, artifact: FakeArtifact) {
        self.runs
            .lock()
            .expect("runs lock")
            .push_back(FakeRun { output, artifact });
    }

    pub fn push_spawn_error(&self, error: LiverecError) {
        self.spawn_errors
            .lock()
            .expect("spawn errors lock")
            .push_back(error);
    }

    /// Raises `stop` while the next streamed process is running.
    pub fn raise_stop_during_next_wait(&self, stop: StopSignal) {
        *self.raise_on_wait.lock().expect("raise lock") = Some(stop);
    }

    pub fn spawned(&self) -> Vec<ProcessRequest> {
        self.spawned.lock().expect("spawned lock").clone()
    }

    pub fn waits(&self) -> Vec<u64> {
        self.waits.lock().expect("waits lock").clone()
    }

    fn next_run(&self, handle: u64) -> Result<FakeRun, LiverecError> {
        self.waits.lock().expect("waits lock").push(handle);
        self.runs
            .lock()
            .expect("runs lock")
            .pop_front()
            .ok_or_else(|| LiverecError::Process("no fake response queued".to_string()))
    }

    fn apply_artifact(&self, handle: u64, artifact: &FakeArtifact) -> Result<(), LiverecError> {
        let Some(fs) = &self.file_system else {
            return Ok(());
        };
        let Some(request) = self.requests.lock().expect("requests lock").get(&handle).cloned()
        else {
            return Ok(());
        };
        let Some(output_path) = request.args.last().map(PathBuf::from) else {
            return Ok(());
        };
        match artifact {
            FakeArtifact::None => Ok(()),
            FakeArtifact::Bytes(len) => {
                fs.set_file_len(output_path, *len);
                Ok(())
            }
            FakeArtifact::ConcatOfList => {
                let list_path = request
                    .args
                    .iter()
                    .position(|arg| arg == "-i")
                    .and_then(|idx| request.args.get(idx + 1))
                    .map(PathBuf::from)
                    .ok_or_else(|| LiverecError::Process("concat list missing".to_string()))?;
                let list = fs.read_to_string(&list_path)?;
                let mut total = 0u64;
                for entry in parse_concat_list(&list) {
                    total += fs.file_size(&entry)?;
                }
                fs.set_file_len(output_path, total);
                Ok(())
            }
        }
    }
}

/// Reads back the paths of an ffmpeg concat list.
pub fn parse_concat_list(list: &str) -> Vec<PathBuf> {
    list.lines()
        .filter_map(|line| line.strip_prefix("file '"))
        .filter_map(|rest| rest.strip_suffix('\''))
        .map(|quoted| PathBuf::from(quoted.replace("'\\''", "'")))
        .collect()
}

impl ProcessRunner for FakeProcessRunner {
    fn spawn(&self, request: ProcessRequest) -> Result<u64, LiverecError> {
        self.spawned
            .lock()
            .expect("spawned lock")
            .push(request.clone());
        if let Some(err) = self.spawn_errors.lock().expect("spawn errors lock").pop_front() {
            return Err(err);
        }
        let mut next = self.next_handle.lock().expect("next lock");
        let handle = *next;
        *next += 1;
        self.requests
            .lock()
            .expect("requests lock")
            .insert(handle, request);
        Ok(handle)
    }

    fn wait(&self, handle: u64) -> Result<ProcessOutput, LiverecError> {
        let run = self.next_run(handle)?;
        if run.output.is_ok() {
            self.apply_artifact(handle, &run.artifact)?;
        }
        run.output
    }

    fn wait_with_line_stream(
        &self,
        handle: u64,
        _stop: &StopSignal,
        on_stderr_line: &mut dyn FnMut(&str),
    ) -> Result<ProcessOutput, LiverecError> {
        let run = self.next_run(handle)?;
        if let Some(stop) = self.raise_on_wait.lock().expect("raise lock").take() {
            stop.raise();
        }
        let output = run.output?;
        for line in output.stderr.split(['\n', '\r']) {
            let line = line.trim();
            if !line.is_empty() {
                on_stderr_line(line);
            }
        }
        self.apply_artifact(handle, &run.artifact)?;
        Ok(output)
    }
}
