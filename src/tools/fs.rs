//! Filesystem tools: read_file, write_file, edit_file, append_file,
//! list_dir. Every path argument goes through the sandbox canonicalizer;
//! paths outside the workspace (and not in the safe-path set) come back
//! as `blocked` error results.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{sandbox_path, truncate_for_llm, Tool, ToolResult};

/// Read cap so one file can't blow the context window.
const MAX_READ_CHARS: usize = 50_000;

/// Shared settings for all filesystem tools.
#[derive(Clone)]
pub struct FsToolConfig {
    pub workspace: PathBuf,
    pub restrict_to_workspace: bool,
}

impl FsToolConfig {
    fn resolve(&self, raw: &str) -> Result<PathBuf, String> {
        sandbox_path(&self.workspace, raw, self.restrict_to_workspace)
    }
}

// ---------------------------------------------------------------------------
// read_file
// ---------------------------------------------------------------------------

pub struct ReadFileTool(pub FsToolConfig);

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file inside the agent workspace."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Workspace-relative path to the file." }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let Some(raw) = args.get("path").and_then(Value::as_str) else {
            return ToolResult::error("read_file: missing `path` argument");
        };
        let path = match self.0.resolve(raw) {
            Ok(p) => p,
            Err(e) => return ToolResult::error(format!("read_file: {e}")),
        };

        match tokio::fs::read_to_string(&path).await {
            Ok(content) => ToolResult::ok(truncate_for_llm(&content, MAX_READ_CHARS)),
            Err(e) => ToolResult::error(format!("read_file: cannot read {raw}: {e}")),
        }
    }
}

// ---------------------------------------------------------------------------
// write_file
// ---------------------------------------------------------------------------

pub struct WriteFileTool(pub FsToolConfig);

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file inside the agent workspace, creating parent directories as needed."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Workspace-relative path to the file." },
                "content": { "type": "string", "description": "Full file content to write." }
            },
            "required": ["path", "content"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let Some(raw) = args.get("path").and_then(Value::as_str) else {
            return ToolResult::error("write_file: missing `path` argument");
        };
        let Some(content) = args.get("content").and_then(Value::as_str) else {
            return ToolResult::error("write_file: missing `content` argument");
        };
        let path = match self.0.resolve(raw) {
            Ok(p) => p,
            Err(e) => return ToolResult::error(format!("write_file: {e}")),
        };

        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return ToolResult::error(format!("write_file: cannot create parent dirs: {e}"));
            }
        }
        match tokio::fs::write(&path, content).await {
            Ok(_) => ToolResult::ok(format!("wrote {} bytes to {raw}", content.len())),
            Err(e) => ToolResult::error(format!("write_file: cannot write {raw}: {e}")),
        }
    }
}

// ---------------------------------------------------------------------------
// edit_file
// ---------------------------------------------------------------------------

pub struct EditFileTool(pub FsToolConfig);

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Replace an exact text fragment in a file inside the agent workspace. \
         The fragment must occur exactly once."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Workspace-relative path to the file." },
                "old_text": { "type": "string", "description": "Exact text to replace." },
                "new_text": { "type": "string", "description": "Replacement text." }
            },
            "required": ["path", "old_text", "new_text"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let (Some(raw), Some(old_text), Some(new_text)) = (
            args.get("path").and_then(Value::as_str),
            args.get("old_text").and_then(Value::as_str),
            args.get("new_text").and_then(Value::as_str),
        ) else {
            return ToolResult::error("edit_file: requires `path`, `old_text`, and `new_text`");
        };
        let path = match self.0.resolve(raw) {
            Ok(p) => p,
            Err(e) => return ToolResult::error(format!("edit_file: {e}")),
        };

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) => return ToolResult::error(format!("edit_file: cannot read {raw}: {e}")),
        };

        let occurrences = content.matches(old_text).count();
        if occurrences == 0 {
            return ToolResult::error(format!("edit_file: `old_text` not found in {raw}"));
        }
        if occurrences > 1 {
            return ToolResult::error(format!(
                "edit_file: `old_text` occurs {occurrences} times in {raw}; make it unique"
            ));
        }

        let updated = content.replacen(old_text, new_text, 1);
        match tokio::fs::write(&path, &updated).await {
            Ok(_) => ToolResult::ok(format!("edited {raw}")),
            Err(e) => ToolResult::error(format!("edit_file: cannot write {raw}: {e}")),
        }
    }
}

// ---------------------------------------------------------------------------
// append_file
// ---------------------------------------------------------------------------

pub struct AppendFileTool(pub FsToolConfig);

#[async_trait]
impl Tool for AppendFileTool {
    fn name(&self) -> &str {
        "append_file"
    }

    fn description(&self) -> &str {
        "Append content to a file inside the agent workspace, creating it if missing."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Workspace-relative path to the file." },
                "content": { "type": "string", "description": "Content to append." }
            },
            "required": ["path", "content"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let (Some(raw), Some(content)) = (
            args.get("path").and_then(Value::as_str),
            args.get("content").and_then(Value::as_str),
        ) else {
            return ToolResult::error("append_file: requires `path` and `content`");
        };
        let path = match self.0.resolve(raw) {
            Ok(p) => p,
            Err(e) => return ToolResult::error(format!("append_file: {e}")),
        };

        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return ToolResult::error(format!("append_file: cannot create parent dirs: {e}"));
            }
        }

        use tokio::io::AsyncWriteExt;
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await;
        match file {
            Ok(mut f) => {
                if let Err(e) = f.write_all(content.as_bytes()).await {
                    return ToolResult::error(format!("append_file: write failed: {e}"));
                }
                ToolResult::ok(format!("appended {} bytes to {raw}", content.len()))
            }
            Err(e) => ToolResult::error(format!("append_file: cannot open {raw}: {e}")),
        }
    }
}

// ---------------------------------------------------------------------------
// list_dir
// ---------------------------------------------------------------------------

pub struct ListDirTool(pub FsToolConfig);

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List the entries of a directory inside the agent workspace."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Workspace-relative directory path; defaults to the workspace root." }
            },
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let raw = args.get("path").and_then(Value::as_str).unwrap_or(".");
        let path = match self.0.resolve(raw) {
            Ok(p) => p,
            Err(e) => return ToolResult::error(format!("list_dir: {e}")),
        };

        let mut rd = match tokio::fs::read_dir(&path).await {
            Ok(rd) => rd,
            Err(e) => return ToolResult::error(format!("list_dir: cannot read {raw}: {e}")),
        };

        let mut entries: Vec<String> = Vec::new();
        loop {
            match rd.next_entry().await {
                Ok(Some(entry)) => {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    let suffix = match entry.file_type().await {
                        Ok(ft) if ft.is_dir() => "/",
                        _ => "",
                    };
                    entries.push(format!("{name}{suffix}"));
                }
                Ok(None) => break,
                Err(e) => return ToolResult::error(format!("list_dir: {e}")),
            }
        }
        entries.sort();

        if entries.is_empty() {
            ToolResult::ok("(empty directory)")
        } else {
            ToolResult::ok(entries.join("\n"))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cfg(ws: &TempDir) -> FsToolConfig {
        FsToolConfig {
            workspace: ws.path().to_path_buf(),
            restrict_to_workspace: true,
        }
    }

    #[tokio::test]
    async fn write_then_read() {
        let ws = TempDir::new().unwrap();
        let write = WriteFileTool(cfg(&ws));
        let read = ReadFileTool(cfg(&ws));

        let result = write
            .execute(json!({"path": "notes/today.md", "content": "remember this"}))
            .await;
        assert!(!result.is_error, "{}", result.for_llm);

        let result = read.execute(json!({"path": "notes/today.md"})).await;
        assert!(!result.is_error);
        assert_eq!(result.for_llm, "remember this");
    }

    #[tokio::test]
    async fn outside_paths_blocked() {
        let ws = TempDir::new().unwrap();
        let read = ReadFileTool(cfg(&ws));
        let write = WriteFileTool(cfg(&ws));

        let result = read.execute(json!({"path": "/etc/passwd"})).await;
        assert!(result.is_error);
        assert!(result.for_llm.contains("blocked"));

        let result = write
            .execute(json!({"path": "../escape.txt", "content": "nope"}))
            .await;
        assert!(result.is_error);
        assert!(result.for_llm.contains("blocked"));
    }

    #[tokio::test]
    async fn safe_path_read_allowed() {
        let ws = TempDir::new().unwrap();
        let read = ReadFileTool(cfg(&ws));
        // /dev/null reads as empty, not blocked.
        let result = read.execute(json!({"path": "/dev/null"})).await;
        assert!(!result.is_error, "{}", result.for_llm);
    }

    #[tokio::test]
    async fn edit_requires_unique_fragment() {
        let ws = TempDir::new().unwrap();
        std::fs::write(ws.path().join("f.txt"), "aaa bbb aaa").unwrap();
        let edit = EditFileTool(cfg(&ws));

        let result = edit
            .execute(json!({"path": "f.txt", "old_text": "aaa", "new_text": "ccc"}))
            .await;
        assert!(result.is_error);
        assert!(result.for_llm.contains("2 times"));

        let result = edit
            .execute(json!({"path": "f.txt", "old_text": "bbb", "new_text": "xxx"}))
            .await;
        assert!(!result.is_error);
        assert_eq!(
            std::fs::read_to_string(ws.path().join("f.txt")).unwrap(),
            "aaa xxx aaa"
        );
    }

    #[tokio::test]
    async fn append_accumulates() {
        let ws = TempDir::new().unwrap();
        let append = AppendFileTool(cfg(&ws));

        append
            .execute(json!({"path": "log.txt", "content": "one\n"}))
            .await;
        append
            .execute(json!({"path": "log.txt", "content": "two\n"}))
            .await;

        assert_eq!(
            std::fs::read_to_string(ws.path().join("log.txt")).unwrap(),
            "one\ntwo\n"
        );
    }

    #[tokio::test]
    async fn list_dir_sorts_and_marks_dirs() {
        let ws = TempDir::new().unwrap();
        std::fs::create_dir(ws.path().join("sub")).unwrap();
        std::fs::write(ws.path().join("a.txt"), "").unwrap();

        let list = ListDirTool(cfg(&ws));
        let result = list.execute(json!({})).await;
        assert!(!result.is_error);
        assert_eq!(result.for_llm, "a.txt\nsub/");
    }
}
