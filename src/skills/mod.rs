//! Skills loader: discovers `skills/<name>/SKILL.md` manifests across
//! workspace, global, and builtin directories (in that precedence) and
//! builds the one-line-per-skill summary injected into the system
//! prompt. The model reads full skill content on demand with the
//! read_file tool.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A discovered skill.
#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub description: String,
    /// Which tier supplied it: "workspace", "global", or "builtin".
    pub scope: &'static str,
    pub path: PathBuf,
}

pub struct SkillsLoader {
    workspace_skills: PathBuf,
    global_skills: PathBuf,
    builtin_skills: PathBuf,
}

impl SkillsLoader {
    pub fn new(workspace: &Path, global_skills: PathBuf, builtin_skills: PathBuf) -> Self {
        Self {
            workspace_skills: workspace.join("skills"),
            global_skills,
            builtin_skills,
        }
    }

    /// All skills, workspace entries shadowing global shadowing builtin.
    pub fn list_skills(&self) -> Vec<Skill> {
        let mut by_name: BTreeMap<String, Skill> = BTreeMap::new();

        // Lowest precedence first so later tiers overwrite.
        for (dir, scope) in [
            (&self.builtin_skills, "builtin"),
            (&self.global_skills, "global"),
            (&self.workspace_skills, "workspace"),
        ] {
            for skill in scan_skills_dir(dir, scope) {
                by_name.insert(skill.name.clone(), skill);
            }
        }

        by_name.into_values().collect()
    }

    /// Markdown list of available skills, empty when none exist.
    pub fn build_skills_summary(&self) -> String {
        let skills = self.list_skills();
        if skills.is_empty() {
            return String::new();
        }

        let mut out = String::new();
        for skill in skills {
            out.push_str(&format!(
                "- **{}**: {} ({})\n",
                skill.name,
                skill.description,
                skill.path.display()
            ));
        }
        out.trim_end().to_string()
    }
}

fn scan_skills_dir(dir: &Path, scope: &'static str) -> Vec<Skill> {
    let mut skills = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return skills;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let manifest = path.join("SKILL.md");
        let Ok(content) = std::fs::read_to_string(&manifest) else {
            continue;
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        skills.push(Skill {
            description: extract_description(&content),
            name,
            scope,
            path: manifest,
        });
    }

    skills
}

/// Description = frontmatter `description:` value when present, else the
/// first non-heading paragraph line.
fn extract_description(content: &str) -> String {
    for line in content.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("description:") {
            return rest.trim().to_string();
        }
    }
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with("---") {
            continue;
        }
        return trimmed.to_string();
    }
    String::new()
}
