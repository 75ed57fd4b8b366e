use crate::logging::append_run_log;
use crate::runtime::{FileSystem, ProcessRequest, ProcessRunner};
use crate::types::SegmentRef;
use chrono::{DateTime, Local};
use serde_json::json;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Recordings smaller than this are stream-start noise and never kept.
pub const MIN_SEGMENT_BYTES: u64 = 1_048_576;
pub const MAX_TITLE_CHARS: usize = 50;
const FILENAME_TIME_FORMAT: &str = "%Y.%m.%d %H.%M.%S";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentDisposition {
    Kept,
    Discarded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finalized {
    Nothing,
    Single(SegmentRef),
    /// Combining is off; every segment stays its own file.
    Separate(Vec<SegmentRef>),
    Concatenated {
        output: PathBuf,
        bytes: u64,
        sources: Vec<PathBuf>,
    },
    ConcatFailed {
        reason: String,
        retained: Vec<SegmentRef>,
    },
}

/// `[platform][user]` prefix that groups every file of one account.
pub fn recording_flag(platform: &str, user_id: &str) -> String {
    format!("[{platform}][{user_id}]")
}

/// `[YYYY.MM.DD HH.MM.SS]<flag><title>.<format>` with filesystem-hostile
/// characters swapped for their full-width forms.
pub fn generate_filename(now: &DateTime<Local>, flag: &str, title: &str, format: &str) -> String {
    let title = sanitize_title(title)
        .chars()
        .take(MAX_TITLE_CHARS)
        .collect::<String>();
    format!("[{}]{flag}{title}.{format}", now.format(FILENAME_TIME_FORMAT))
}

pub fn sanitize_title(title: &str) -> String {
    title
        .chars()
        .map(|c| match c {
            '"' => '＂',
            '*' => '＊',
            ':' => '：',
            '<' => '＜',
            '>' => '＞',
            '?' => '？',
            '/' => '／',
            '\\' => '＼',
            '|' => '｜',
            '\n' | '\r' | '\t' => ' ',
            other => other,
        })
        .collect()
}

/// First free path among `name`, `name (1)`, `name (2)`, ...
pub fn unique_path(fs: &dyn FileSystem, dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !fs.exists(&candidate) {
        return candidate;
    }
    let (stem, ext) = match file_name.rsplit_once('.') {
        Some((stem, ext)) => (stem, format!(".{ext}")),
        None => (file_name, String::new()),
    };
    let mut n = 1u32;
    loop {
        let candidate = dir.join(format!("{stem} ({n}){ext}"));
        if !fs.exists(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// One `file '<path>'` line per segment, single quotes escaped for ffmpeg.
pub fn render_concat_list(segments: &[SegmentRef]) -> String {
    segments
        .iter()
        .map(|segment| {
            let quoted = segment.path.to_string_lossy().replace('\'', "'\\''");
            format!("file '{quoted}'\n")
        })
        .collect()
}

/// Segments recorded during one broadcast, in append order.
pub struct SegmentStore {
    fs: Arc<dyn FileSystem>,
    runner: Arc<dyn ProcessRunner>,
    program: String,
    output_dir: PathBuf,
    format: String,
    keep_originals: bool,
    combine: bool,
    segments: Vec<SegmentRef>,
}

impl SegmentStore {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        runner: Arc<dyn ProcessRunner>,
        program: impl Into<String>,
        output_dir: impl Into<PathBuf>,
        format: impl Into<String>,
        keep_originals: bool,
    ) -> Self {
        Self {
            fs,
            runner,
            program: program.into(),
            output_dir: output_dir.into(),
            format: format.into(),
            keep_originals,
            combine: true,
            segments: Vec::new(),
        }
    }

    /// When disabled, `finalize` hands back the segments untouched.
    pub fn with_combine(mut self, combine: bool) -> Self {
        self.combine = combine;
        self
    }

    pub fn segments(&self) -> &[SegmentRef] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn record(&mut self, segment: SegmentRef) -> SegmentDisposition {
        if segment.size_bytes >= MIN_SEGMENT_BYTES {
            append_run_log(
                "info",
                "segments.kept",
                json!({
                    "path": segment.path.display().to_string(),
                    "bytes": segment.size_bytes,
                    "count": self.segments.len() + 1,
                }),
            );
            self.segments.push(segment);
            return SegmentDisposition::Kept;
        }

        if self.fs.exists(&segment.path) {
            if let Err(err) = self.fs.remove_file(&segment.path) {
                append_run_log(
                    "warn",
                    "segments.discard_failed",
                    json!({
                        "path": segment.path.display().to_string(),
                        "error": err.to_string(),
                    }),
                );
            }
        }
        append_run_log(
            "info",
            "segments.discarded",
            json!({
                "path": segment.path.display().to_string(),
                "bytes": segment.size_bytes,
            }),
        );
        SegmentDisposition::Discarded
    }

    /// Drains the store. More than one segment is joined with the ffmpeg
    /// concat demuxer unless combining is off; originals are only touched
    /// once the join succeeded.
    pub fn finalize(&mut self, flag: &str, title: &str, now: &DateTime<Local>) -> Finalized {
        let segments = std::mem::take(&mut self.segments);
        match segments.len() {
            0 => Finalized::Nothing,
            1 => segments
                .into_iter()
                .next()
                .map(Finalized::Single)
                .unwrap_or(Finalized::Nothing),
            _ if !self.combine => {
                append_run_log(
                    "info",
                    "segments.kept_separate",
                    json!({ "segments": segments.len() }),
                );
                Finalized::Separate(segments)
            }
            _ => self.concatenate(segments, flag, title, now),
        }
    }

    fn concatenate(
        &self,
        segments: Vec<SegmentRef>,
        flag: &str,
        title: &str,
        now: &DateTime<Local>,
    ) -> Finalized {
        let file_name = generate_filename(now, flag, &format!("{title}_concat"), &self.format);
        let output = unique_path(self.fs.as_ref(), &self.output_dir, &file_name);
        let list_path = {
            let mut raw = OsString::from(output.as_os_str());
            raw.push(".concat.txt");
            PathBuf::from(raw)
        };

        let result = self
            .fs
            .write_string(&list_path, &render_concat_list(&segments))
            .map_err(|e| e.to_string())
            .and_then(|()| self.run_concat(&list_path, &output));
        if self.fs.exists(&list_path) {
            let _ = self.fs.remove_file(&list_path);
        }

        if let Err(reason) = result {
            append_run_log(
                "error",
                "segments.concat_failed",
                json!({
                    "output": output.display().to_string(),
                    "reason": reason,
                    "retained": segments.len(),
                }),
            );
            return Finalized::ConcatFailed {
                reason,
                retained: segments,
            };
        }

        let sources = segments
            .iter()
            .map(|segment| segment.path.clone())
            .collect::<Vec<_>>();
        self.dispose_originals(&output, &sources);
        let bytes = self.fs.file_size(&output).unwrap_or(0);
        append_run_log(
            "info",
            "segments.concatenated",
            json!({
                "output": output.display().to_string(),
                "bytes": bytes,
                "sources": sources.len(),
                "kept_originals": self.keep_originals,
            }),
        );
        Finalized::Concatenated {
            output,
            bytes,
            sources,
        }
    }

    fn run_concat(&self, list_path: &Path, output: &Path) -> Result<(), String> {
        let request = ProcessRequest {
            program: self.program.clone(),
            args: vec![
                "-hide_banner".to_string(),
                "-loglevel".to_string(),
                "error".to_string(),
                "-f".to_string(),
                "concat".to_string(),
                "-safe".to_string(),
                "0".to_string(),
                "-i".to_string(),
                list_path.display().to_string(),
                "-c".to_string(),
                "copy".to_string(),
                output.display().to_string(),
            ],
            cwd: None,
        };
        let out = self.runner.run(request).map_err(|e| e.to_string())?;
        if out.exit_code == 0 {
            return Ok(());
        }
        let stderr = out.stderr.trim();
        if stderr.is_empty() {
            Err(format!("concat exited with status {}", out.exit_code))
        } else {
            Err(stderr.to_string())
        }
    }

    fn dispose_originals(&self, output: &Path, sources: &[PathBuf]) {
        let parts_dir = if self.keep_originals {
            let stem = output
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "concat".to_string());
            let dir = self.output_dir.join(format!("{stem}_parts"));
            if let Err(err) = self.fs.create_dir_all(&dir) {
                append_run_log(
                    "warn",
                    "segments.parts_dir_failed",
                    json!({ "dir": dir.display().to_string(), "error": err.to_string() }),
                );
                return;
            }
            Some(dir)
        } else {
            None
        };

        for source in sources {
            let outcome = match (&parts_dir, source.file_name()) {
                (Some(dir), Some(name)) => self.fs.rename(source, &dir.join(name)),
                _ => self.fs.remove_file(source),
            };
            if let Err(err) = outcome {
                append_run_log(
                    "warn",
                    "segments.cleanup_failed",
                    json!({ "path": source.display().to_string(), "error": err.to_string() }),
                );
            }
        }
    }
}
