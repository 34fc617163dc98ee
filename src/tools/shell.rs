//! Sandboxed shell tool.
//!
//! Deny patterns block destructive commands (disk wipes, block-device
//! writes, shutdowns, fork bombs); user-configured allow patterns exempt
//! specific command shapes from the deny list. Under workspace
//! restriction, absolute and `..`-relative path arguments must resolve
//! inside the workspace or the safe-path set — `/dev/null` redirections
//! are always permitted.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use tracing::warn;

use super::{canon_or_resolve, sandbox_path, truncate_for_llm, Tool, ToolResult, SAFE_PATHS};
use crate::config::ExecConfig;

/// Combined stdout+stderr cap before truncation.
const MAX_OUTPUT_CHARS: usize = 15_000;

/// Block device families that must never be written.
const BLOCK_DEVICE: &str = r"(?:sd[a-z]|hd[a-z]|vd[a-z]|xvd[a-z]|nvme\d+n\d+|mmcblk\d+|loop\d+|dm-\d+|md\d+|sr\d+|nbd\d+)";

/// Built-in deny patterns, case-insensitive.
static DENY_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    let raw = [
        // Recursive deletion of the filesystem root.
        r"\brm\s+(-[a-z]+\s+)*-[a-z]*[rf][a-z]*\s+(-[a-z-]+\s+)*/\s*(?:$|;|&|\|)".to_string(),
        r"\brm\b.*--no-preserve-root".to_string(),
        // Filesystem creation.
        r"\bmkfs(\.\w+)?\b".to_string(),
        // Raw writes to block devices via dd.
        format!(r"\bdd\b[^|;&]*\bof=/dev/{BLOCK_DEVICE}"),
        // Power state.
        r"\b(shutdown|reboot|halt|poweroff)\b".to_string(),
        // Classic fork bomb.
        r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:".to_string(),
        // Redirections onto block devices.
        format!(r">+\s*/dev/{BLOCK_DEVICE}"),
    ];
    raw.iter()
        .map(|p| Regex::new(&format!("(?i){p}")).expect("invalid builtin deny pattern"))
        .collect()
});

pub struct ExecTool {
    workspace: PathBuf,
    restrict_to_workspace: bool,
    timeout: Duration,
    enable_deny_patterns: bool,
    allow_patterns: Vec<Regex>,
}

impl ExecTool {
    pub fn new(workspace: impl Into<PathBuf>, restrict_to_workspace: bool) -> Self {
        Self {
            workspace: workspace.into(),
            restrict_to_workspace,
            timeout: Duration::from_secs(120),
            enable_deny_patterns: true,
            allow_patterns: Vec::new(),
        }
    }

    pub fn with_config(
        workspace: impl Into<PathBuf>,
        restrict_to_workspace: bool,
        exec: &ExecConfig,
    ) -> anyhow::Result<Self> {
        let allow_patterns = exec
            .custom_allow_patterns
            .iter()
            .map(|p| Regex::new(&format!("(?i){p}")))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!("invalid custom allow pattern: {e}"))?;

        Ok(Self {
            workspace: workspace.into(),
            restrict_to_workspace,
            timeout: Duration::from_secs(exec.timeout_secs.max(1)),
            enable_deny_patterns: exec.enable_deny_patterns,
            allow_patterns,
        })
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn set_restrict_to_workspace(&mut self, restrict: bool) {
        self.restrict_to_workspace = restrict;
    }

    /// Deny-pattern check; allow patterns exempt a matching command.
    fn check_deny_patterns(&self, command: &str) -> Result<(), String> {
        if !self.enable_deny_patterns {
            return Ok(());
        }
        if self.allow_patterns.iter().any(|re| re.is_match(command)) {
            return Ok(());
        }
        for re in DENY_PATTERNS.iter() {
            if re.is_match(command) {
                return Err(format!(
                    "blocked: command matches deny pattern `{}`",
                    re.as_str()
                ));
            }
        }
        Ok(())
    }

    /// Under workspace restriction, every absolute or `..`-relative path
    /// token must resolve inside the workspace or the safe-path set.
    fn check_command_paths(&self, command: &str, working_dir: &Path) -> Result<(), String> {
        if !self.restrict_to_workspace {
            return Ok(());
        }

        for token in extract_path_tokens(command) {
            if SAFE_PATHS.contains(&token.as_str()) {
                continue;
            }
            let candidate = if Path::new(&token).is_absolute() {
                PathBuf::from(&token)
            } else {
                working_dir.join(&token)
            };
            let resolved = match canon_or_resolve(&candidate) {
                Ok(p) => p,
                // Paths that cannot resolve at all aren't reachable files.
                Err(_) => continue,
            };
            if SAFE_PATHS.iter().any(|p| Path::new(p) == resolved) {
                continue;
            }
            let ws = self
                .workspace
                .canonicalize()
                .map_err(|e| format!("blocked: workspace unavailable: {e}"))?;
            if !resolved.starts_with(&ws) {
                return Err(format!(
                    "blocked: path outside working dir: {}",
                    resolved.display()
                ));
            }
        }

        Ok(())
    }

    /// Resolve and validate the effective working directory.
    fn resolve_working_dir(&self, args: &Value) -> Result<PathBuf, String> {
        let Some(raw) = args.get("working_dir").and_then(Value::as_str) else {
            return Ok(self.workspace.clone());
        };

        let resolved = sandbox_path(&self.workspace, raw, self.restrict_to_workspace)?;
        if !resolved.is_dir() {
            return Err(format!(
                "blocked: working_dir is not a directory: {}",
                resolved.display()
            ));
        }
        Ok(resolved)
    }
}

/// Pull out tokens that look like filesystem paths: absolute tokens and
/// relative ones containing `..`. Redirection operators are stripped so
/// `2>/dev/null` yields `/dev/null`.
fn extract_path_tokens(command: &str) -> Vec<String> {
    let mut out = Vec::new();
    for raw in command.split_whitespace() {
        let token = raw
            .trim_start_matches(|c: char| c.is_ascii_digit())
            .trim_start_matches(['>', '<'])
            .trim_matches(['\'', '"', ';', '&', '|', '(', ')']);
        if token.is_empty() {
            continue;
        }
        // `2>&1` and friends are fd duplications, not paths.
        if token.starts_with('&') {
            continue;
        }
        // `if=`/`of=` style key=value arguments carry the path after '='.
        let path = token.rsplit_once('=').map(|(_, v)| v).unwrap_or(token);
        if path.starts_with('/') || path.split('/').any(|seg| seg == "..") {
            out.push(path.to_string());
        }
    }
    out
}

#[async_trait]
impl Tool for ExecTool {
    fn name(&self) -> &str {
        "exec"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the agent workspace. Destructive commands \
         (disk wipes, block-device writes, shutdown) are blocked. Output is \
         truncated past 15000 characters."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "Shell command to execute (via `sh -c`)."
                },
                "working_dir": {
                    "type": "string",
                    "description": "Optional working directory; must stay inside the workspace when restriction is active."
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let Some(command) = args.get("command").and_then(Value::as_str) else {
            return ToolResult::error("exec: missing `command` argument");
        };

        if let Err(reason) = self.check_deny_patterns(command) {
            return ToolResult::error(format!("exec: {reason}"));
        }

        let working_dir = match self.resolve_working_dir(&args) {
            Ok(dir) => dir,
            Err(reason) => return ToolResult::error(format!("exec: {reason}")),
        };

        if let Err(reason) = self.check_command_paths(command, &working_dir) {
            return ToolResult::error(format!("exec: {reason}"));
        }

        if tokio::fs::create_dir_all(&working_dir).await.is_err() {
            return ToolResult::error(format!(
                "exec: cannot create working dir {}",
                working_dir.display()
            ));
        }

        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&working_dir)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .process_group(0)
            .spawn();

        let child = match child {
            Ok(c) => c,
            Err(e) => return ToolResult::error(format!("exec: spawn failed: {e}")),
        };

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => return ToolResult::error(format!("exec: {e}")),
            Err(_) => {
                // kill_on_drop reaps the process group on the dropped child.
                warn!(timeout_secs = self.timeout.as_secs(), "shell command timed out");
                return ToolResult::error(format!(
                    "exec: command timed out after {}s",
                    self.timeout.as_secs()
                ));
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !stderr.is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }
        let combined = truncate_for_llm(&combined, MAX_OUTPUT_CHARS);

        let code = output.status.code().unwrap_or(-1);
        if code == 0 {
            ToolResult {
                is_error: false,
                for_llm: if combined.is_empty() {
                    "(no output)".to_string()
                } else {
                    combined.clone()
                },
                for_user: combined,
            }
        } else {
            ToolResult {
                is_error: true,
                for_llm: format!("Exit code: {code}\n{combined}"),
                for_user: combined,
            }
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

    fn tool(restrict: bool) -> (TempDir, ExecTool) {
        let ws = TempDir::new().unwrap();
        let tool = ExecTool::new(ws.path(), restrict);
        (ws, tool)
    }

    #[tokio::test]
    async fn success_captures_output() {
        let (_ws, tool) = tool(false);
        let result = tool.execute(json!({"command": "echo 'hello world'"})).await;
        assert!(!result.is_error, "{}", result.for_llm);
        assert!(result.for_llm.contains("hello world"));
        assert!(result.for_user.contains("hello world"));
    }

    #[tokio::test]
    async fn failure_reports_exit_code() {
        let (_ws, tool) = tool(false);
        let result = tool
            .execute(json!({"command": "ls /nonexistent_directory_12345"}))
            .await;
        assert!(result.is_error);
        assert!(result.for_llm.contains("Exit code"));
    }

    #[tokio::test]
    async fn timeout_mentions_timed_out() {
        let (_ws, mut t) = tool(false);
        t.set_timeout(Duration::from_millis(100));
        let result = t.execute(json!({"command": "sleep 10"})).await;
        assert!(result.is_error);
        assert!(result.for_llm.contains("timed out"));
    }

    #[tokio::test]
    async fn stderr_is_captured() {
        let (_ws, tool) = tool(false);
        let result = tool
            .execute(json!({"command": "sh -c 'echo out; echo err >&2'"}))
            .await;
        assert!(result.for_llm.contains("out"));
        assert!(result.for_llm.contains("err"));
    }

    #[tokio::test]
    async fn long_output_truncated() {
        let (_ws, tool) = tool(false);
        let result = tool
            .execute(json!({"command": "head -c 40000 /dev/zero | tr '\\0' 'x'"}))
            .await;
        assert!(result.for_llm.len() <= MAX_OUTPUT_CHARS + 100);
        assert!(result.for_llm.contains("[output truncated]"));
    }

    #[tokio::test]
    async fn dangerous_command_blocked() {
        let (_ws, tool) = tool(false);
        let result = tool.execute(json!({"command": "rm -rf /"})).await;
        assert!(result.is_error);
        assert!(result.for_llm.contains("blocked"));
    }

    #[tokio::test]
    async fn missing_command_is_error() {
        let (_ws, tool) = tool(false);
        let result = tool.execute(json!({})).await;
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn custom_working_dir_used() {
        let other = TempDir::new().unwrap();
        std::fs::write(other.path().join("test.txt"), "test content").unwrap();
        let (_ws, tool) = tool(false);

        let result = tool
            .execute(json!({
                "command": "cat test.txt",
                "working_dir": other.path().to_str().unwrap(),
            }))
            .await;
        assert!(!result.is_error, "{}", result.for_llm);
        assert!(result.for_user.contains("test content"));
    }

    #[tokio::test]
    async fn working_dir_outside_workspace_blocked() {
        let root = TempDir::new().unwrap();
        let ws = root.path().join("workspace");
        let outside = root.path().join("outside");
        std::fs::create_dir_all(&ws).unwrap();
        std::fs::create_dir_all(&outside).unwrap();

        let tool = ExecTool::new(&ws, true);
        let result = tool
            .execute(json!({
                "command": "pwd",
                "working_dir": outside.to_str().unwrap(),
            }))
            .await;
        assert!(result.is_error);
        assert!(result.for_llm.contains("blocked"));
    }

    #[tokio::test]
    async fn symlink_working_dir_escape_blocked() {
        let root = TempDir::new().unwrap();
        let ws = root.path().join("workspace");
        let secret = root.path().join("secret");
        std::fs::create_dir_all(&ws).unwrap();
        std::fs::create_dir_all(&secret).unwrap();
        std::fs::write(secret.join("secret.txt"), "top secret").unwrap();

        let link = ws.join("escape");
        if std::os::unix::fs::symlink(&secret, &link).is_err() {
            return; // symlinks unsupported in this environment
        }

        let tool = ExecTool::new(&ws, true);
        let result = tool
            .execute(json!({
                "command": "cat secret.txt",
                "working_dir": link.to_str().unwrap(),
            }))
            .await;
        assert!(result.is_error);
        assert!(result.for_llm.contains("blocked"));
    }

    #[tokio::test]
    async fn path_traversal_blocked_under_restriction() {
        let (_ws, tool) = tool(true);
        let result = tool.execute(json!({"command": "cat ../../etc/passwd"})).await;
        assert!(result.is_error);
        assert!(result.for_llm.contains("blocked"));
    }

    #[tokio::test]
    async fn dev_null_redirections_allowed() {
        let (ws, tool) = tool(true);
        let commands = [
            "echo hello 2>/dev/null".to_string(),
            "echo hello >/dev/null".to_string(),
            "echo hello > /dev/null".to_string(),
            "echo hello 2> /dev/null".to_string(),
            "echo hello >/dev/null 2>&1".to_string(),
            format!("find {} -name '*.rs' 2>/dev/null", ws.path().display()),
        ];
        for cmd in &commands {
            let result = tool.execute(json!({"command": cmd})).await;
            assert!(
                !(result.is_error && result.for_llm.contains("blocked")),
                "command should not be blocked: {cmd}\n  error: {}",
                result.for_llm
            );
        }
    }

    #[tokio::test]
    async fn block_device_writes_blocked() {
        let (_ws, tool) = tool(false);
        let blocked = [
            "echo x > /dev/sda",
            "echo x > /dev/hda",
            "echo x > /dev/vda",
            "echo x > /dev/xvda",
            "echo x > /dev/nvme0n1",
            "echo x > /dev/mmcblk0",
            "echo x > /dev/loop0",
            "echo x > /dev/dm-0",
            "echo x > /dev/md0",
            "echo x > /dev/sr0",
            "echo x > /dev/nbd0",
        ];
        for cmd in blocked {
            let result = tool.execute(json!({"command": cmd})).await;
            assert!(result.is_error, "expected block device write blocked: {cmd}");
        }
    }

    #[tokio::test]
    async fn safe_paths_pass_workspace_restriction() {
        let (_ws, tool) = tool(true);
        let commands = [
            "head -c 16 /dev/urandom | od",
            "echo test > /dev/null",
            "dd if=/dev/zero bs=1 count=1",
        ];
        for cmd in commands {
            let result = tool.execute(json!({"command": cmd})).await;
            assert!(
                !result.for_llm.contains("path outside working dir"),
                "safe path should not be blocked: {cmd}\n  error: {}",
                result.for_llm
            );
        }
    }

    #[tokio::test]
    async fn custom_allow_pattern_exempts_from_deny() {
        let ws = TempDir::new().unwrap();
        let exec = ExecConfig {
            timeout_secs: 10,
            enable_deny_patterns: true,
            custom_allow_patterns: vec![r"\becho\s+ok\s+shutdown\b".into()],
        };
        let tool = ExecTool::with_config(ws.path(), false, &exec).unwrap();

        // Matching the allow pattern exempts it from the shutdown deny rule.
        let result = tool.execute(json!({"command": "echo ok shutdown"})).await;
        assert!(
            !(result.is_error && result.for_llm.contains("blocked")),
            "allow pattern should exempt: {}",
            result.for_llm
        );

        // Non-matching variants stay blocked.
        let result = tool.execute(json!({"command": "echo no shutdown"})).await;
        assert!(result.is_error);
        assert!(result.for_llm.contains("blocked"));
    }

    #[tokio::test]
    async fn fork_bomb_blocked() {
        let (_ws, tool) = tool(false);
        let result = tool.execute(json!({"command": ":(){ :|:& };:"})).await;
        assert!(result.is_error);
        assert!(result.for_llm.contains("blocked"));
    }

    #[test]
    fn path_token_extraction() {
        assert_eq!(
            extract_path_tokens("cat /etc/passwd"),
            vec!["/etc/passwd".to_string()]
        );
        assert_eq!(
            extract_path_tokens("echo hi 2>/dev/null"),
            vec!["/dev/null".to_string()]
        );
        assert_eq!(
            extract_path_tokens("cat ../../etc/shadow"),
            vec!["../../etc/shadow".to_string()]
        );
        assert_eq!(
            extract_path_tokens("dd if=/dev/zero of=out.bin"),
            vec!["/dev/zero".to_string()]
        );
        assert!(extract_path_tokens("echo hello >/dev/null 2>&1")
            .iter()
            .all(|t| t == "/dev/null"));
        assert!(extract_path_tokens("ls -la").is_empty());
    }
}
