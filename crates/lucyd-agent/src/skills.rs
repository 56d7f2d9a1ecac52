//! Skill discovery and loading.
//!
//! A skill is a directory under the workspace skills dir containing a
//! `SKILL.md` with a small frontmatter header (name, description) and a
//! markdown body. The index goes into the semi-stable prompt tier;
//! bodies load on demand through the `load_skill` tool, except for
//! always-on skills which are inlined.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub description: String,
    pub body: String,
}

pub struct SkillLoader {
    skills_path: PathBuf,
    skills: Mutex<HashMap<String, Skill>>,
}

impl SkillLoader {
    pub fn new(workspace: &std::path::Path, skills_dir: &str) -> Self {
        Self {
            skills_path: workspace.join(skills_dir),
            skills: Mutex::new(HashMap::new()),
        }
    }

    /// Scan the skills directory. Called at startup and on SIGUSR1.
    pub fn scan(&self) {
        let mut found = HashMap::new();
        let entries = match std::fs::read_dir(&self.skills_path) {
            Ok(entries) => entries,
            Err(_) => {
                debug!(path = %self.skills_path.display(), "no skills directory");
                *self.skills.lock().unwrap() = found;
                return;
            }
        };

        for entry in entries.filter_map(|e| e.ok()) {
            let skill_md = entry.path().join("SKILL.md");
            if !skill_md.is_file() {
                continue;
            }
            match std::fs::read_to_string(&skill_md) {
                Ok(content) => {
                    let fallback = entry.file_name().to_string_lossy().to_string();
                    let skill = parse_skill(&content, &fallback);
                    found.insert(skill.name.clone(), skill);
                }
                Err(e) => {
                    warn!(file = %skill_md.display(), error = %e, "failed to read skill");
                }
            }
        }

        info!(count = found.len(), "skills scanned");
        *self.skills.lock().unwrap() = found;
    }

    /// One line per skill: `- name: description`.
    pub fn build_index(&self) -> String {
        let skills = self.skills.lock().unwrap();
        let mut names: Vec<&String> = skills.keys().collect();
        names.sort();
        names
            .iter()
            .map(|n| format!("- {}: {}", n, skills[*n].description))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn get_body(&self, name: &str) -> Option<String> {
        self.skills.lock().unwrap().get(name).map(|s| s.body.clone())
    }

    /// Bodies for the requested (always-on) skills.
    pub fn get_bodies(&self, names: &[String]) -> HashMap<String, String> {
        let skills = self.skills.lock().unwrap();
        names
            .iter()
            .filter_map(|n| skills.get(n).map(|s| (n.clone(), s.body.clone())))
            .collect()
    }

    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.skills.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Parse `SKILL.md`: optional `---` frontmatter with `name:` and
/// `description:`, body is everything after.
fn parse_skill(content: &str, fallback_name: &str) -> Skill {
    let mut name = fallback_name.to_string();
    let mut description = String::new();
    let mut body = content;

    if let Some(rest) = content.strip_prefix("---") {
        if let Some(end) = rest.find("\n---") {
            for line in rest[..end].lines() {
                if let Some(v) = line.strip_prefix("name:") {
                    name = v.trim().to_string();
                } else if let Some(v) = line.strip_prefix("description:") {
                    description = v.trim().to_string();
                }
            }
            body = rest[end + 4..].trim_start_matches('\n');
        }
    }

    Skill {
        name,
        description,
        body: body.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_frontmatter_and_body() {
        let skill = parse_skill(
            "---\nname: weather\ndescription: Check the weather.\n---\n\nCall the API.",
            "dir-name",
        );
        assert_eq!(skill.name, "weather");
        assert_eq!(skill.description, "Check the weather.");
        assert_eq!(skill.body, "Call the API.");
    }

    #[test]
    fn missing_frontmatter_falls_back_to_dir_name() {
        let skill = parse_skill("Just a body.", "plain");
        assert_eq!(skill.name, "plain");
        assert_eq!(skill.body, "Just a body.");
    }

    #[test]
    fn scan_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let skill_dir = dir.path().join("skills").join("weather");
        std::fs::create_dir_all(&skill_dir).unwrap();
        std::fs::write(
            skill_dir.join("SKILL.md"),
            "---\nname: weather\ndescription: Check the weather.\n---\nBody.",
        )
        .unwrap();

        let loader = SkillLoader::new(dir.path(), "skills");
        loader.scan();
        assert_eq!(loader.build_index(), "- weather: Check the weather.");
        assert_eq!(loader.get_body("weather").unwrap(), "Body.");
        assert!(loader.get_body("none").is_none());
    }

    #[test]
    fn missing_skills_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let loader = SkillLoader::new(dir.path(), "skills");
        loader.scan();
        assert_eq!(loader.build_index(), "");
        assert!(loader.list_names().is_empty());
    }
}
