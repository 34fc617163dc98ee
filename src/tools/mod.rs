//! Tool surface: the [`Tool`] trait, [`ToolResult`], the name-keyed
//! registry, and the workspace sandbox path canonicalizer shared by
//! every filesystem-touching tool.

pub mod fs;
pub mod shell;
pub mod spawn;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::providers::ToolDefinition;

// ---------------------------------------------------------------------------
// ToolResult
// ---------------------------------------------------------------------------

/// Outcome of one tool execution.
///
/// `for_llm` is what the model sees (possibly truncated); `for_user` is
/// surfaced to the channel when a tool chooses to speak directly.
#[derive(Debug, Clone, Default)]
pub struct ToolResult {
    pub is_error: bool,
    pub for_llm: String,
    pub for_user: String,
}

impl ToolResult {
    pub fn ok(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            is_error: false,
            for_user: text.clone(),
            for_llm: text,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            is_error: true,
            for_user: text.clone(),
            for_llm: text,
        }
    }
}

// ---------------------------------------------------------------------------
// Tool trait + registry
// ---------------------------------------------------------------------------

/// A capability the model can invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON-Schema object describing the arguments.
    fn parameters(&self) -> Value;
    async fn execute(&self, args: Value) -> ToolResult;
}

/// Name-keyed tool map, effectively read-only after startup.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Tool definitions as advertised to the LLM.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Execute a tool under a deadline and cancellation token.
    ///
    /// Unknown names, missing required arguments, timeouts, and
    /// cancellation all become error results — the loop continues and
    /// the model may adapt.
    pub async fn execute(
        &self,
        name: &str,
        args: Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ToolResult {
        let Some(tool) = self.get(name) else {
            return ToolResult::error(format!("unknown tool: {name}"));
        };

        if let Err(missing) = validate_required_args(&tool.parameters(), &args) {
            return ToolResult::error(format!(
                "{name}: missing required argument(s): {missing}"
            ));
        }

        debug!(tool = %name, "executing tool");
        tokio::select! {
            _ = cancel.cancelled() => {
                warn!(tool = %name, "tool execution cancelled");
                ToolResult::error(format!("{name}: cancelled"))
            }
            result = tokio::time::timeout(timeout, tool.execute(args)) => match result {
                Ok(r) => r,
                Err(_) => {
                    warn!(tool = %name, timeout_secs = timeout.as_secs(), "tool execution timed out");
                    ToolResult::error(format!(
                        "{name}: timed out after {}s",
                        timeout.as_secs()
                    ))
                }
            },
        }
    }
}

/// Check the schema's `required` list against the provided object.
fn validate_required_args(schema: &Value, args: &Value) -> Result<(), String> {
    let Some(required) = schema.get("required").and_then(Value::as_array) else {
        return Ok(());
    };
    let missing: Vec<&str> = required
        .iter()
        .filter_map(Value::as_str)
        .filter(|key| args.get(key).map_or(true, Value::is_null))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(missing.join(", "))
    }
}

// ---------------------------------------------------------------------------
// Workspace sandbox
// ---------------------------------------------------------------------------

/// Kernel pseudo-devices exempt from the workspace sandbox.
pub const SAFE_PATHS: &[&str] = &[
    "/dev/null",
    "/dev/zero",
    "/dev/urandom",
    "/dev/random",
    "/dev/stdin",
    "/dev/stdout",
    "/dev/stderr",
];

/// Canonicalize a path argument and enforce the workspace sandbox.
///
/// The path is resolved to absolute (relative paths join the workspace),
/// then realpath'd through its longest existing prefix so symlinks are
/// followed before the containment check. Admitted iff the result is
/// under the canonical workspace root or exactly matches a safe path.
/// No string-level `..` heuristic — only the resolved path counts.
pub fn sandbox_path(
    workspace: &Path,
    raw: &str,
    restrict_to_workspace: bool,
) -> Result<PathBuf, String> {
    let candidate = if Path::new(raw).is_absolute() {
        PathBuf::from(raw)
    } else {
        workspace.join(raw)
    };

    if SAFE_PATHS.iter().any(|p| Path::new(p) == candidate) {
        return Ok(candidate);
    }

    let resolved = canon_or_resolve(&candidate)
        .map_err(|e| format!("blocked: cannot resolve path {raw}: {e}"))?;

    if SAFE_PATHS.iter().any(|p| Path::new(p) == resolved) {
        return Ok(resolved);
    }

    if restrict_to_workspace {
        let ws_canon = workspace
            .canonicalize()
            .map_err(|e| format!("blocked: workspace unavailable: {e}"))?;
        if !resolved.starts_with(&ws_canon) {
            return Err(format!(
                "blocked: path outside working dir: {} is not under {}",
                resolved.display(),
                ws_canon.display()
            ));
        }
    }

    Ok(resolved)
}

/// Realpath that tolerates not-yet-existing leaf components: the longest
/// existing ancestor is canonicalized (following symlinks) and the
/// remaining tail re-appended.
pub fn canon_or_resolve(p: &Path) -> std::io::Result<PathBuf> {
    if p.exists() {
        return p.canonicalize();
    }

    let mut existing = p.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    while !existing.exists() {
        match existing.file_name() {
            Some(name) => tail.push(name.to_os_string()),
            None => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("cannot resolve path: {}", p.display()),
                ))
            }
        }
        existing = match existing.parent() {
            Some(parent) => parent.to_path_buf(),
            None => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("cannot resolve path: {}", p.display()),
                ))
            }
        };
    }

    let mut resolved = existing.canonicalize()?;
    for component in tail.into_iter().rev() {
        resolved.push(component);
    }
    Ok(resolved)
}

/// Truncate text for the model on a char boundary, appending a notice
/// when anything was dropped.
pub fn truncate_for_llm(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    format!("{truncated}\n... [output truncated]")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo the input back."
        }
        fn parameters(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            })
        }
        async fn execute(&self, args: Value) -> ToolResult {
            ToolResult::ok(args["text"].as_str().unwrap_or_default().to_string())
        }
    }

    fn registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(EchoTool));
        reg
    }

    #[tokio::test]
    async fn unknown_tool_is_error() {
        let reg = registry();
        let result = reg
            .execute(
                "nope",
                json!({}),
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await;
        assert!(result.is_error);
        assert!(result.for_llm.contains("unknown tool"));
    }

    #[tokio::test]
    async fn missing_required_arg_is_error() {
        let reg = registry();
        let result = reg
            .execute(
                "echo",
                json!({}),
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await;
        assert!(result.is_error);
        assert!(result.for_llm.contains("text"));
    }

    #[tokio::test]
    async fn execute_happy_path() {
        let reg = registry();
        let result = reg
            .execute(
                "echo",
                json!({"text": "hi"}),
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await;
        assert!(!result.is_error);
        assert_eq!(result.for_llm, "hi");
    }

    #[tokio::test]
    async fn cancelled_execution_errors() {
        struct SlowTool;

        #[async_trait]
        impl Tool for SlowTool {
            fn name(&self) -> &str {
                "slow"
            }
            fn description(&self) -> &str {
                "sleeps"
            }
            fn parameters(&self) -> Value {
                json!({"type": "object"})
            }
            async fn execute(&self, _args: Value) -> ToolResult {
                tokio::time::sleep(Duration::from_secs(30)).await;
                ToolResult::ok("done")
            }
        }

        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(SlowTool));

        let cancel = CancellationToken::new();
        let child = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            child.cancel();
        });

        let result = reg
            .execute("slow", json!({}), Duration::from_secs(60), &cancel)
            .await;
        assert!(result.is_error);
        assert!(result.for_llm.contains("cancelled"));
    }

    #[test]
    fn sandbox_admits_workspace_paths() {
        let ws = TempDir::new().unwrap();
        std::fs::write(ws.path().join("inside.txt"), "x").unwrap();

        let ok = sandbox_path(ws.path(), "inside.txt", true).unwrap();
        assert!(ok.ends_with("inside.txt"));

        // Not-yet-existing file in workspace is fine (writes).
        assert!(sandbox_path(ws.path(), "new/dir/file.txt", true).is_ok());
    }

    #[test]
    fn sandbox_blocks_outside_paths() {
        let ws = TempDir::new().unwrap();
        let err = sandbox_path(ws.path(), "/etc/passwd", true).unwrap_err();
        assert!(err.contains("blocked"));

        let err = sandbox_path(ws.path(), "../../../etc/shadow", true).unwrap_err();
        assert!(err.contains("blocked"));
    }

    #[test]
    fn sandbox_blocks_symlink_escape() {
        let root = TempDir::new().unwrap();
        let ws = root.path().join("workspace");
        let secret = root.path().join("secret");
        std::fs::create_dir_all(&ws).unwrap();
        std::fs::create_dir_all(&secret).unwrap();
        std::fs::write(secret.join("secret.txt"), "top secret").unwrap();

        let link = ws.join("escape");
        if std::os::unix::fs::symlink(&secret, &link).is_err() {
            return; // symlinks unsupported here
        }

        let err = sandbox_path(&ws, "escape/secret.txt", true).unwrap_err();
        assert!(err.contains("blocked"));
    }

    #[test]
    fn safe_paths_allowed_under_restriction() {
        let ws = TempDir::new().unwrap();
        for p in SAFE_PATHS {
            assert!(
                sandbox_path(ws.path(), p, true).is_ok(),
                "safe path {p} should be admitted"
            );
        }
    }

    #[test]
    fn unrestricted_mode_admits_outside() {
        let ws = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        let target = other.path().join("f.txt");
        std::fs::write(&target, "x").unwrap();
        assert!(sandbox_path(ws.path(), target.to_str().unwrap(), false).is_ok());
    }

    #[test]
    fn truncation_appends_notice() {
        let text = "x".repeat(100);
        let out = truncate_for_llm(&text, 10);
        assert!(out.starts_with("xxxxxxxxxx"));
        assert!(out.contains("[output truncated]"));
        assert_eq!(truncate_for_llm("short", 10), "short");
    }
}
