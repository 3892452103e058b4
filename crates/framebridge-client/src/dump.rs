//! Debug dumps of frame bytes at each stage of the send path.

use std::collections::HashSet;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::{json, Map, Value};
use tracing::{info, warn};

/// Where in the send path a dump was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DumpStage {
    /// Raw RGBA pixels as handed to the sender.
    RgbaRaw,
    /// Compressed (or raw fallback) chunk body.
    TcpChunk,
    /// Chunk with its length prefix, as queued.
    TcpFramed,
}

impl DumpStage {
    pub fn as_str(self) -> &'static str {
        match self {
            DumpStage::RgbaRaw => "rgba_raw",
            DumpStage::TcpChunk => "tcp_chunk",
            DumpStage::TcpFramed => "tcp_framed",
        }
    }
}

impl fmt::Display for DumpStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives frame bytes for offline inspection.
pub trait DebugSink: Send + Sync {
    /// A new stream started; forget which frames were already dumped.
    fn start_session(&self);

    fn dump(&self, frame_id: u64, stage: DumpStage, payload: &[u8], meta: Value);

    /// Callers skip building metadata when this is false.
    fn is_active(&self) -> bool {
        true
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl DebugSink for NoopSink {
    fn start_session(&self) {}

    fn dump(&self, _frame_id: u64, _stage: DumpStage, _payload: &[u8], _meta: Value) {}

    fn is_active(&self) -> bool {
        false
    }
}

#[derive(Debug, Default)]
struct DumpState {
    session_dir: Option<PathBuf>,
    frames: HashSet<u64>,
    sessions: u64,
}

/// Writes `frame_{id:06}_{stage}.bin` plus a `.json` sidecar under a
/// per-session directory, for at most `max_frames` distinct frames.
#[derive(Debug)]
pub struct FileDumpSink {
    root: PathBuf,
    max_frames: usize,
    state: Mutex<DumpState>,
}

impl FileDumpSink {
    pub fn new(root: impl Into<PathBuf>, max_frames: usize) -> Self {
        Self {
            root: root.into(),
            max_frames: max_frames.max(1),
            state: Mutex::new(DumpState::default()),
        }
    }

    /// `$TMPDIR/framebridge_dump`.
    pub fn default_root() -> PathBuf {
        std::env::temp_dir().join("framebridge_dump")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_frames(&self) -> usize {
        self.max_frames
    }

    /// Directory of the current session, once the first frame was dumped.
    pub fn session_dir(&self) -> Option<PathBuf> {
        self.lock().session_dir.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DumpState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserve a frame slot and return the session directory to write into.
    fn reserve(&self, frame_id: u64) -> Option<PathBuf> {
        let mut state = self.lock();
        if !state.frames.contains(&frame_id) {
            if state.frames.len() >= self.max_frames {
                return None;
            }
            state.frames.insert(frame_id);
        }

        if let Some(dir) = &state.session_dir {
            return Some(dir.clone());
        }

        state.sessions += 1;
        let dir = self.root.join(format!(
            "session_{}_{}_{}",
            unix_millis(),
            std::process::id(),
            state.sessions
        ));
        if let Err(err) = fs::create_dir_all(&dir) {
            warn!(dir = %dir.display(), error = %err, "failed to create dump directory");
            return None;
        }
        info!(dir = %dir.display(), "frame dumps enabled");
        append_log(&dir, &format!("session start: {}", dir.display()));
        state.session_dir = Some(dir.clone());
        Some(dir)
    }
}

impl DebugSink for FileDumpSink {
    fn start_session(&self) {
        let mut state = self.lock();
        state.frames.clear();
        state.session_dir = None;
    }

    fn dump(&self, frame_id: u64, stage: DumpStage, payload: &[u8], meta: Value) {
        let Some(dir) = self.reserve(frame_id) else {
            return;
        };

        let base = format!("frame_{frame_id:06}_{stage}");
        let mut record = Map::new();
        record.insert("frameId".into(), json!(frame_id));
        record.insert("stage".into(), json!(stage.as_str()));
        record.insert("byteLength".into(), json!(payload.len()));
        record.insert("previewHex".into(), json!(preview_hex(payload, 32)));
        record.insert("writtenAtMs".into(), json!(unix_millis()));
        if let Value::Object(extra) = meta {
            record.extend(extra);
        }

        let result = fs::write(dir.join(format!("{base}.bin")), payload).and_then(|()| {
            let body = serde_json::to_vec_pretty(&Value::Object(record))?;
            fs::write(dir.join(format!("{base}.json")), body)
        });
        match result {
            Ok(()) => append_log(&dir, &format!("{base}.bin bytes={}", payload.len())),
            Err(err) => {
                warn!(frame_id, %stage, error = %err, "failed to write frame dump");
                append_log(&dir, &format!("write failed for {base}: {err}"));
            }
        }
    }
}

fn append_log(dir: &Path, line: &str) {
    let path = dir.join("bridge_dump.log");
    let written = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .and_then(|mut file| writeln!(file, "{} {line}", unix_millis()));
    if let Err(err) = written {
        warn!(path = %path.display(), error = %err, "failed to append dump log");
    }
}

fn preview_hex(payload: &[u8], max: usize) -> String {
    payload
        .iter()
        .take(max)
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn unix_millis() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "fb-dump-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ))
    }

    #[test]
    fn writes_bin_and_json_with_merged_meta() {
        let root = temp_root("write");
        let sink = FileDumpSink::new(&root, 3);
        sink.start_session();
        sink.dump(1, DumpStage::RgbaRaw, &[0xAB, 0xCD], json!({"width": 1}));

        let dir = sink.session_dir().expect("session dir should exist");
        let bin = fs::read(dir.join("frame_000001_rgba_raw.bin")).unwrap();
        assert_eq!(bin, vec![0xAB, 0xCD]);

        let meta: Value =
            serde_json::from_slice(&fs::read(dir.join("frame_000001_rgba_raw.json")).unwrap())
                .unwrap();
        assert_eq!(meta["frameId"], 1);
        assert_eq!(meta["stage"], "rgba_raw");
        assert_eq!(meta["byteLength"], 2);
        assert_eq!(meta["previewHex"], "abcd");
        assert_eq!(meta["width"], 1);
        assert!(dir.join("bridge_dump.log").exists());

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn limits_distinct_frames_but_allows_all_stages() {
        let root = temp_root("limit");
        let sink = FileDumpSink::new(&root, 2);
        for id in 1..=4 {
            sink.dump(id, DumpStage::RgbaRaw, b"x", Value::Null);
            sink.dump(id, DumpStage::TcpChunk, b"y", Value::Null);
        }

        let dir = sink.session_dir().unwrap();
        assert!(dir.join("frame_000002_tcp_chunk.bin").exists());
        assert!(!dir.join("frame_000003_rgba_raw.bin").exists());

        sink.start_session();
        sink.dump(3, DumpStage::RgbaRaw, b"x", Value::Null);
        let next = sink.session_dir().unwrap();
        assert_ne!(dir, next);
        assert!(next.join("frame_000003_rgba_raw.bin").exists());

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn noop_sink_is_inactive() {
        assert!(!NoopSink.is_active());
        NoopSink.dump(1, DumpStage::TcpFramed, b"", Value::Null);
    }
}
