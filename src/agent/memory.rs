//! Long-term memory context: the contents of `memory/MEMORY.md` in the
//! workspace, injected into the static system prompt. The model keeps
//! the file current through its filesystem tools.

use std::path::{Path, PathBuf};

pub struct MemoryStore {
    workspace: PathBuf,
}

impl MemoryStore {
    pub fn new(workspace: &Path) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
        }
    }

    pub fn memory_path(&self) -> PathBuf {
        self.workspace.join("memory").join("MEMORY.md")
    }

    /// Memory file contents, empty when the file is missing or blank.
    pub fn get_memory_context(&self) -> String {
        std::fs::read_to_string(self.memory_path())
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    }
}
