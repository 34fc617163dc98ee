//! Session persistence: one directory per session-key under
//! `<workspace>/sessions/`, holding a JSON history file (ordered array
//! of messages) and a plaintext summary file.
//!
//! Per-key mutexes (partitioned in a concurrent map) serialize
//! load/mutate/persist so history stays linearizable within a session
//! while different sessions progress in parallel.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use dashmap::DashMap;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use crate::providers::Message;

/// In-memory view of one session.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub messages: Vec<Message>,
    pub summary: String,
}

/// Store rooted at an agent workspace.
pub struct SessionStore {
    workspace: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionStore {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            locks: DashMap::new(),
        }
    }

    /// Per-session-key mutex. The agent loop holds the guard for the
    /// whole turn so writes are serialized per key.
    pub fn lock_for(&self, session_key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(session_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn session_dir(&self, session_key: &str) -> PathBuf {
        self.workspace
            .join("sessions")
            .join(sanitize_key(session_key))
    }

    /// Load history and summary; a session that never existed loads
    /// empty.
    pub async fn load(&self, session_key: &str) -> anyhow::Result<Session> {
        let dir = self.session_dir(session_key);

        let messages = match fs::read_to_string(dir.join("history.json")).await {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("malformed session history for {session_key}"))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e).context("read session history"),
        };

        let summary = match fs::read_to_string(dir.join("summary.txt")).await {
            Ok(s) => s.trim().to_string(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e).context("read session summary"),
        };

        Ok(Session { messages, summary })
    }

    /// Persist the whole session. History is written atomically via a
    /// temp-file rename so a crash never leaves a half-written file.
    pub async fn save(&self, session_key: &str, session: &Session) -> anyhow::Result<()> {
        let dir = self.session_dir(session_key);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("create session dir {}", dir.display()))?;

        let history = serde_json::to_string_pretty(&session.messages)
            .context("serialize session history")?;
        let tmp = dir.join("history.json.tmp");
        fs::write(&tmp, &history).await.context("write history tmp")?;
        fs::rename(&tmp, dir.join("history.json"))
            .await
            .context("commit history")?;

        fs::write(dir.join("summary.txt"), &session.summary)
            .await
            .context("write summary")?;

        debug!(
            session = %session_key,
            turns = session.messages.len(),
            "session persisted"
        );
        Ok(())
    }

    /// Delete session directories whose history was last modified more
    /// than `max_age` ago. Returns the number removed.
    pub async fn cleanup_expired(&self, max_age: std::time::Duration) -> anyhow::Result<usize> {
        let sessions_dir = self.workspace.join("sessions");
        let mut rd = match fs::read_dir(&sessions_dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e).context("read sessions dir"),
        };

        let now = std::time::SystemTime::now();
        let mut deleted = 0usize;

        while let Some(entry) = rd.next_entry().await? {
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            let history = dir.join("history.json");
            let modified = match fs::metadata(&history).await.and_then(|m| m.modified()) {
                Ok(t) => t,
                Err(_) => continue,
            };
            if let Ok(age) = now.duration_since(modified) {
                if age > max_age && fs::remove_dir_all(&dir).await.is_ok() {
                    debug!(path = %dir.display(), "expired session removed");
                    deleted += 1;
                }
            }
        }

        Ok(deleted)
    }
}

/// Session keys like "telegram:12345" must become safe directory names.
fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '.' => c,
            _ => '_',
        })
        .collect()
}

/// List session keys currently on disk (sanitized directory names).
pub async fn list_sessions(workspace: &Path) -> anyhow::Result<Vec<String>> {
    let sessions_dir = workspace.join("sessions");
    let mut rd = match fs::read_dir(&sessions_dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).context("read sessions dir"),
    };

    let mut keys = Vec::new();
    while let Some(entry) = rd.next_entry().await? {
        if entry.path().is_dir() {
            keys.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    keys.sort();
    Ok(keys)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
