// src/store/mod.rs — Per-session on-disk storage
//
// Layout, one directory per (channel, broadcast start):
//
//   <data_root>/raw_chat/channel=<name>/stream=<started_at, ':' -> '-'>/
//       chat.jsonl              one chat event per line
//       stream_snapshots.jsonl  one status snapshot per line
//       meta.json               session metadata, atomically rewritten
//
// The field names in every file match what the downstream analytics scripts
// already parse; changing them is a breaking change.

use std::fs::{File, OpenOptions};
use std::io::{LineWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::infra::errors::CollectorError;
use crate::status::StreamInfo;

/// Session metadata record. `ended_at` is null exactly while the in-memory
/// session exists; once written non-null the record is never touched again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub channel: String,
    pub user_id: String,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub title: String,
    pub game_name: String,
    pub viewer_count: u64,
}

/// One periodic point-in-time record of a live session's mutable fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSnapshot {
    pub timestamp_utc: String,
    pub title: String,
    pub game_name: String,
    pub viewer_count: u64,
}

/// An open capture session. `channel` + `started_at` are the immutable key;
/// title/game/viewer_count are refreshed on every poll tick while live.
pub struct Session {
    pub channel: String,
    pub user_id: String,
    pub started_at: String,
    pub title: String,
    pub game_name: String,
    pub viewer_count: u64,

    meta_path: PathBuf,
    // LineWriter flushes on newline: each appended record reaches the OS
    // without a per-line fsync.
    chat: LineWriter<File>,
    snapshots: LineWriter<File>,
}

impl Session {
    fn meta(&self, ended_at: Option<String>) -> SessionMeta {
        SessionMeta {
            channel: self.channel.clone(),
            user_id: self.user_id.clone(),
            started_at: self.started_at.clone(),
            ended_at,
            title: self.title.clone(),
            game_name: self.game_name.clone(),
            viewer_count: self.viewer_count,
        }
    }
}

pub struct SessionStore {
    data_root: PathBuf,
}

impl SessionStore {
    pub fn new(data_root: PathBuf) -> Self {
        Self { data_root }
    }

    /// Fail fast at startup if the root isn't writable, instead of losing a
    /// session to a permissions error mid-run.
    pub fn ensure_root(&self) -> Result<(), CollectorError> {
        std::fs::create_dir_all(&self.data_root)?;
        let probe = self.data_root.join(".write_test");
        std::fs::write(&probe, "ok\n")?;
        std::fs::remove_file(&probe)?;
        Ok(())
    }

    pub fn session_dir(&self, channel: &str, started_at: &str) -> PathBuf {
        self.data_root
            .join("raw_chat")
            .join(format!("channel={}", safe_name(channel)))
            .join(format!("stream={}", started_at.replace(':', "-")))
    }

    /// Create the session directory, open both append logs, and write the
    /// initial metadata record with `ended_at` unset.
    pub fn open_session(&self, info: &StreamInfo) -> Result<Session, CollectorError> {
        let dir = self.session_dir(&info.user_login, &info.started_at);
        std::fs::create_dir_all(&dir)?;

        let chat = line_appender(&dir.join("chat.jsonl"))?;
        let snapshots = line_appender(&dir.join("stream_snapshots.jsonl"))?;
        let meta_path = dir.join("meta.json");

        let session = Session {
            channel: info.user_login.clone(),
            user_id: info.user_id.clone(),
            started_at: info.started_at.clone(),
            title: info.title.clone(),
            game_name: info.game_name.clone(),
            viewer_count: info.viewer_count,
            meta_path,
            chat,
            snapshots,
        };

        atomic_write_json(&session.meta_path, &session.meta(None))?;
        Ok(session)
    }

    pub fn append_chat<T: Serialize>(
        &self,
        session: &mut Session,
        event: &T,
    ) -> Result<(), CollectorError> {
        append_jsonl(&mut session.chat, event)
    }

    pub fn append_snapshot(
        &self,
        session: &mut Session,
        snapshot: &StreamSnapshot,
    ) -> Result<(), CollectorError> {
        append_jsonl(&mut session.snapshots, snapshot)
    }

    /// Flush and drop both log handles, then rewrite the metadata record
    /// with `ended_at` set. Consumes the session: nothing can append to a
    /// closed session's handles afterwards.
    pub fn close_session(
        &self,
        mut session: Session,
        ended_at: &str,
    ) -> Result<(), CollectorError> {
        if let Err(e) = session.chat.flush() {
            tracing::warn!(channel = %session.channel, "chat log flush failed: {e}");
        }
        if let Err(e) = session.snapshots.flush() {
            tracing::warn!(channel = %session.channel, "snapshot log flush failed: {e}");
        }

        let meta = session.meta(Some(ended_at.to_string()));
        atomic_write_json(&session.meta_path, &meta)
    }
}

fn line_appender(path: &Path) -> Result<LineWriter<File>, CollectorError> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LineWriter::new(file))
}

fn append_jsonl<T: Serialize>(
    writer: &mut LineWriter<File>,
    record: &T,
) -> Result<(), CollectorError> {
    let line = serde_json::to_string(record)?;
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\n")?;
    Ok(())
}

/// Write pretty-printed JSON to a temp file in the same directory, then
/// rename over the final path. A crash mid-write never leaves a truncated
/// metadata file for a reader to trip over.
fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), CollectorError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut body = serde_json::to_vec_pretty(value)?;
    body.push(b'\n');
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Filesystem-safe channel name: lowercase, runs of characters outside
/// `[a-z0-9_-]` collapse to a single '_', leading/trailing '_' trimmed.
pub fn safe_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_was_sub = false;
    for c in raw.trim().to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-' {
            out.push(c);
            last_was_sub = false;
        } else if !last_was_sub {
            out.push('_');
            last_was_sub = true;
        }
    }
    out.trim_matches('_').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_name() {
        assert_eq!(safe_name("SomeChannel"), "somechannel");
        assert_eq!(safe_name("a b!c"), "a_b_c");
        assert_eq!(safe_name("__x__"), "x");
        assert_eq!(safe_name("ok_name-1"), "ok_name-1");
        assert_eq!(safe_name("!!!"), "");
    }

    #[test]
    fn test_session_dir_sanitizes_start_time() {
        let store = SessionStore::new(PathBuf::from("/data"));
        let dir = store.session_dir("chan", "2026-08-30T12:34:56Z");
        assert_eq!(
            dir,
            PathBuf::from("/data/raw_chat/channel=chan/stream=2026-08-30T12-34-56Z")
        );
    }
}
