//! Context assembler — builds the tiered system prompt from workspace
//! files, tool descriptions, skills, and per-turn dynamic annotations.
//!
//! Files are read fresh on every build, so editing a persona file takes
//! effect on the next message without a restart.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::Local;
use tracing::{debug, info, warn};

use lucyd_core::config::TierOverride;
use lucyd_core::types::{CacheTier, SystemBlock};

/// Per-turn inputs to [`ContextAssembler::build`].
#[derive(Default)]
pub struct BuildParams<'a> {
    /// "full" or a configured override name (e.g. "operational").
    pub tier: &'a str,
    /// Ingress source tag; "system" and "http" get an annotation.
    pub source: &'a str,
    pub tool_descriptions: &'a [(String, String)],
    pub skill_index: &'a str,
    pub always_on_skills: &'a [String],
    pub skill_bodies: Option<&'a HashMap<String, String>>,
    /// Recall text and other one-off dynamic context.
    pub extra_dynamic: &'a str,
    /// Inbound carried a voice note and a TTS tool is registered.
    pub voice_reply_hint: bool,
}

pub struct ContextAssembler {
    workspace: PathBuf,
    stable_files: Vec<String>,
    semi_stable_files: Vec<String>,
    tier_overrides: HashMap<String, TierOverride>,
}

impl ContextAssembler {
    pub fn new(
        workspace: PathBuf,
        stable_files: Vec<String>,
        semi_stable_files: Vec<String>,
        tier_overrides: HashMap<String, TierOverride>,
    ) -> Self {
        Self {
            workspace,
            stable_files,
            semi_stable_files,
            tier_overrides,
        }
    }

    /// Build the system prompt blocks for one turn.
    pub fn build(&self, params: &BuildParams<'_>) -> Vec<SystemBlock> {
        let mut blocks = Vec::new();
        let (stable, semi_stable) = self.files_for_tier(params.tier);

        // Stable: persona files + tool instructions
        let mut stable_text = self.read_files(&stable);
        if !params.tool_descriptions.is_empty() {
            stable_text.push_str("\n\n## Available Tools\n\n");
            for (name, desc) in params.tool_descriptions {
                stable_text.push_str(&format!("- **{name}**: {desc}\n"));
            }
        }
        if !stable_text.trim().is_empty() {
            blocks.push(SystemBlock::new(stable_text, CacheTier::Stable));
        }

        // Semi-stable: memory files + always-on skill bodies + skill index
        let mut semi_text = self.read_files(&semi_stable);
        if let Some(bodies) = params.skill_bodies {
            for skill_name in params.always_on_skills {
                if let Some(body) = bodies.get(skill_name).filter(|b| !b.is_empty()) {
                    semi_text.push_str(&format!("\n\n## Skill: {skill_name}\n\n{body}"));
                }
            }
        }
        if !params.skill_index.is_empty() {
            semi_text.push_str(&format!(
                "\n\n## Available Skills\n\n{}\n\nUse the `load_skill` tool to load a skill's full instructions.",
                params.skill_index
            ));
        }
        if !semi_text.trim().is_empty() {
            blocks.push(SystemBlock::new(semi_text, CacheTier::SemiStable));
        }

        // Dynamic: changes every turn
        let dynamic = self.build_dynamic(params);
        if !dynamic.trim().is_empty() {
            blocks.push(SystemBlock::new(dynamic, CacheTier::Dynamic));
        }

        blocks
    }

    /// Only the persona blocks. Used by consolidation for persona-aware
    /// episode extraction — voice, not identity.
    pub fn build_stable(&self) -> Vec<SystemBlock> {
        let text = self.read_files(&self.stable_files);
        if text.trim().is_empty() {
            return Vec::new();
        }
        vec![SystemBlock::new(text, CacheTier::Stable)]
    }

    /// Workspace files are read fresh on each build, so this only logs
    /// intent (SIGUSR1 handler).
    pub fn reload(&self) {
        info!("context reload triggered (files re-read on next build)");
    }

    fn files_for_tier(&self, tier: &str) -> (Vec<String>, Vec<String>) {
        if tier == "full" || tier.is_empty() {
            return (self.stable_files.clone(), self.semi_stable_files.clone());
        }
        match self.tier_overrides.get(tier) {
            Some(over) => (over.stable.clone(), over.semi_stable.clone()),
            None => (Vec::new(), Vec::new()),
        }
    }

    fn read_files(&self, file_names: &[String]) -> String {
        let mut parts = Vec::new();
        for name in file_names {
            let path = self.workspace.join(name);
            match std::fs::read_to_string(&path) {
                Ok(content) => parts.push(content),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(file = %path.display(), "context file not found");
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "failed to read context file");
                }
            }
        }
        parts.join("\n\n")
    }

    fn build_dynamic(&self, params: &BuildParams<'_>) -> String {
        let now = Local::now().format("%a, %d. %b %Y - %H:%M %Z");
        let mut parts = vec![format!("Current date/time: {now}")];

        match params.source {
            "system" => parts.push(
                "Session type: automated infrastructure. \
                 Messages in this session are cron-triggered system automation, \
                 not from the user. Execute tasks as instructed. \
                 Replies are internal only — not delivered to any channel."
                    .to_string(),
            ),
            "http" => parts.push(
                "Session type: HTTP API integration. \
                 Messages in this session come from an external automation pipeline \
                 (scripts, webhooks), not from the user via the primary channel. \
                 Process requests and return useful responses. \
                 Use the message tool to notify the user on the primary channel \
                 if the results warrant it."
                    .to_string(),
            ),
            _ => {}
        }

        if params.voice_reply_hint {
            parts.push(
                "The user sent a voice message. Consider replying with the tts \
                 tool so they can listen to your answer."
                    .to_string(),
            );
        }

        if !params.extra_dynamic.is_empty() {
            parts.push(params.extra_dynamic.to_string());
        }
        parts.join("\n")
    }
}
