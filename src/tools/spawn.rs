//! Spawn tool: run an isolated child agent over a single task and return
//! its final answer as the tool result.
//!
//! The child gets fresh history and shares the parent's provider
//! configuration. The concrete runner is injected by the agent module at
//! startup; child registries omit this tool so spawning stays depth-1.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use super::{Tool, ToolResult};

/// Runs one isolated child-agent task to completion.
#[async_trait]
pub trait SubagentRunner: Send + Sync {
    async fn run(&self, task: &str) -> anyhow::Result<String>;
}

pub struct SpawnTool {
    runner: Arc<dyn SubagentRunner>,
}

impl SpawnTool {
    pub fn new(runner: Arc<dyn SubagentRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl Tool for SpawnTool {
    fn name(&self) -> &str {
        "spawn"
    }

    fn description(&self) -> &str {
        "Delegate a self-contained task to an isolated sub-agent with fresh \
         history. Returns the sub-agent's final answer."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "Complete, self-contained task description for the sub-agent."
                }
            },
            "required": ["task"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let Some(task) = args.get("task").and_then(Value::as_str) else {
            return ToolResult::error("spawn: missing `task` argument");
        };
        if task.trim().is_empty() {
            return ToolResult::error("spawn: `task` must not be empty");
        }

        match self.runner.run(task).await {
            Ok(answer) => ToolResult::ok(answer),
            Err(e) => ToolResult::error(format!("spawn: sub-agent failed: {e}")),
        }
    }
}
