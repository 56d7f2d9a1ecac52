use std::collections::HashMap;
use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level config (lucyd.toml + LUCYD_* env overrides).
///
/// Every tunable has a serde default so a minimal config file (agent name,
/// one model, channel type) is enough to start the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LucydConfig {
    pub agent: AgentConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,
    /// Ingress source → model name. Unlisted sources use "primary".
    #[serde(default)]
    pub routing: HashMap<String, String>,
    #[serde(default)]
    pub behavior: BehaviorConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub vision: VisionConfig,
    #[serde(default)]
    pub stt: SttConfig,
    #[serde(default)]
    pub documents: DocumentsConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
}

impl LucydConfig {
    /// Load from a TOML file with `LUCYD_*` environment overrides
    /// (double underscore as section separator, e.g. `LUCYD_HTTP__PORT`).
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: LucydConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("LUCYD_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.name.is_empty() {
            return Err(ConfigError::Invalid("agent.name must not be empty".into()));
        }
        if !self.models.contains_key("primary") {
            return Err(ConfigError::Invalid(
                "models must define a 'primary' entry".into(),
            ));
        }
        Ok(())
    }

    /// Resolve the model name for an ingress source.
    pub fn route_model(&self, source: &str) -> String {
        self.routing
            .get(source)
            .cloned()
            .unwrap_or_else(|| "primary".to_string())
    }

    pub fn model(&self, name: &str) -> Option<&ModelConfig> {
        self.models.get(name)
    }

    pub fn state_dir(&self) -> &Path {
        &self.agent.state_dir
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.agent.sessions_dir.clone()
    }

    pub fn cost_db(&self) -> PathBuf {
        self.agent.state_dir.join("cost.db")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_sessions_dir")]
    pub sessions_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Transport adapter name ("cli" is built in; others are wired by the host).
    #[serde(rename = "type", default = "default_channel_type")]
    pub channel_type: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            channel_type: default_channel_type(),
        }
    }
}

/// One model entry under `[models.<name>]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider family ("anthropic-compat" is built in).
    #[serde(default = "default_provider_type")]
    pub provider: String,
    /// Provider-side model identifier.
    pub model: String,
    /// Environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub max_context_tokens: u64,
    #[serde(default)]
    pub supports_vision: bool,
    /// USD per million tokens: [input, output, cache_read, cache_write].
    #[serde(default)]
    pub cost_per_mtok: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    /// Overall per-message deadline in seconds.
    #[serde(default = "default_agent_timeout")]
    pub agent_timeout_secs: u64,
    /// 0.0 disables the per-message cost cutoff.
    #[serde(default)]
    pub max_cost_per_message: f64,
    /// Whole-message retries on transient provider failure.
    #[serde(default = "default_message_retries")]
    pub message_retries: u32,
    #[serde(default = "default_message_retry_base_delay")]
    pub message_retry_base_delay_secs: f64,
    /// Per-call provider retries inside the agentic loop.
    #[serde(default = "default_api_retries")]
    pub api_retries: u32,
    #[serde(default = "default_api_retry_base_delay")]
    pub api_retry_base_delay_secs: f64,
    /// Replies starting or ending with one of these are not delivered.
    #[serde(default)]
    pub silent_tokens: Vec<String>,
    #[serde(default = "default_error_message")]
    pub error_message: String,
    #[serde(default = "default_true")]
    pub typing_indicators: bool,
    /// Tool output truncation in chars.
    #[serde(default = "default_output_truncation")]
    pub output_truncation: usize,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            max_turns: default_max_turns(),
            agent_timeout_secs: default_agent_timeout(),
            max_cost_per_message: 0.0,
            message_retries: default_message_retries(),
            message_retry_base_delay_secs: default_message_retry_base_delay(),
            api_retries: default_api_retries(),
            api_retry_base_delay_secs: default_api_retry_base_delay(),
            silent_tokens: Vec::new(),
            error_message: default_error_message(),
            typing_indicators: true,
            output_truncation: default_output_truncation(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Input-token threshold that triggers compaction.
    #[serde(default = "default_compaction_threshold")]
    pub threshold: u64,
    /// Messages kept verbatim after the summary.
    #[serde(default = "default_keep_recent")]
    pub keep_recent: usize,
    #[serde(default = "default_compaction_model")]
    pub model: String,
    #[serde(default = "default_compaction_prompt")]
    pub prompt: String,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            threshold: default_compaction_threshold(),
            keep_recent: default_keep_recent(),
            model: default_compaction_model(),
            prompt: default_compaction_prompt(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionConfig {
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: usize,
    #[serde(default = "default_max_dimension")]
    pub max_dimension: u32,
    #[serde(default = "default_jpeg_quality_steps")]
    pub jpeg_quality_steps: Vec<u8>,
    #[serde(default = "default_image_caption")]
    pub default_caption: String,
    #[serde(default = "default_too_large_msg")]
    pub too_large_msg: String,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            max_image_bytes: default_max_image_bytes(),
            max_dimension: default_max_dimension(),
            jpeg_quality_steps: default_jpeg_quality_steps(),
            default_caption: default_image_caption(),
            too_large_msg: default_too_large_msg(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttConfig {
    /// "local" (whisper.cpp endpoint), "openai", or "" to disable.
    #[serde(default)]
    pub backend: String,
    #[serde(default = "default_stt_local_endpoint")]
    pub local_endpoint: String,
    #[serde(default = "default_stt_language")]
    pub local_language: String,
    #[serde(default = "default_stt_ffmpeg_timeout")]
    pub local_ffmpeg_timeout_secs: u64,
    #[serde(default = "default_stt_request_timeout")]
    pub local_request_timeout_secs: u64,
    #[serde(default = "default_stt_openai_url")]
    pub openai_api_url: String,
    #[serde(default = "default_stt_openai_model")]
    pub openai_model: String,
    #[serde(default = "default_stt_request_timeout")]
    pub openai_timeout_secs: u64,
    #[serde(default = "default_stt_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_voice_label")]
    pub voice_label: String,
    #[serde(default = "default_voice_fail_msg")]
    pub voice_fail_msg: String,
    #[serde(default = "default_audio_label")]
    pub audio_label: String,
    #[serde(default = "default_audio_fail_msg")]
    pub audio_fail_msg: String,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            backend: String::new(),
            local_endpoint: default_stt_local_endpoint(),
            local_language: default_stt_language(),
            local_ffmpeg_timeout_secs: default_stt_ffmpeg_timeout(),
            local_request_timeout_secs: default_stt_request_timeout(),
            openai_api_url: default_stt_openai_url(),
            openai_model: default_stt_openai_model(),
            openai_timeout_secs: default_stt_request_timeout(),
            api_key_env: default_stt_api_key_env(),
            voice_label: default_voice_label(),
            voice_fail_msg: default_voice_fail_msg(),
            audio_label: default_audio_label(),
            audio_fail_msg: default_audio_fail_msg(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_doc_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_doc_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_text_extensions")]
    pub text_extensions: Vec<String>,
}

impl Default for DocumentsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_chars: default_doc_max_chars(),
            max_file_bytes: default_doc_max_file_bytes(),
            text_extensions: default_text_extensions(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MemoryConfig {
    /// Path to memory.db; None disables structured memory entirely.
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub recall: RecallConfig,
    #[serde(default)]
    pub consolidation: ConsolidationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub api_key_env: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            model: String::new(),
            api_key_env: String::new(),
            provider: String::new(),
            timeout_secs: default_embedding_timeout(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_configured(&self) -> bool {
        !self.base_url.is_empty() && !self.model.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallConfig {
    #[serde(default = "default_max_facts")]
    pub max_facts: usize,
    #[serde(default = "default_max_episodes_at_start")]
    pub max_episodes_at_start: usize,
    #[serde(default = "default_max_dynamic_tokens")]
    pub max_dynamic_tokens: usize,
    #[serde(default = "default_decay_rate")]
    pub decay_rate: f64,
    /// "natural" (`entity — attr: value`) or "compact" (`entity.attr: value`).
    #[serde(default = "default_fact_format")]
    pub fact_format: String,
    #[serde(default = "default_true")]
    pub show_emotional_tone: bool,
    #[serde(default = "default_episode_header")]
    pub episode_section_header: String,
    /// "structured" (raw blocks), "narrative", or "factual".
    #[serde(default = "default_synthesis_style")]
    pub synthesis_style: String,
    #[serde(default = "default_priority_facts")]
    pub priority_facts: i32,
    #[serde(default = "default_priority_episodes")]
    pub priority_episodes: i32,
    #[serde(default = "default_priority_vector")]
    pub priority_vector: i32,
    #[serde(default = "default_priority_commitments")]
    pub priority_commitments: i32,
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            max_facts: default_max_facts(),
            max_episodes_at_start: default_max_episodes_at_start(),
            max_dynamic_tokens: default_max_dynamic_tokens(),
            decay_rate: default_decay_rate(),
            fact_format: default_fact_format(),
            show_emotional_tone: true,
            episode_section_header: default_episode_header(),
            synthesis_style: default_synthesis_style(),
            priority_facts: default_priority_facts(),
            priority_episodes: default_priority_episodes(),
            priority_vector: default_priority_vector(),
            priority_commitments: default_priority_commitments(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidationConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Unprocessed ranges smaller than this are skipped.
    #[serde(default = "default_min_messages")]
    pub min_messages: usize,
    #[serde(default = "default_max_extraction_chars")]
    pub max_extraction_chars: usize,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_messages: default_min_messages(),
            max_extraction_chars: default_max_extraction_chars(),
            confidence_threshold: default_confidence_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContextConfig {
    /// Persona files, read into the stable tier.
    #[serde(default)]
    pub stable_files: Vec<String>,
    /// Memory / user files, read into the semi-stable tier.
    #[serde(default)]
    pub semi_stable_files: Vec<String>,
    /// Named tier overrides selecting file subsets (e.g. "operational").
    #[serde(default)]
    pub tiers: HashMap<String, TierOverride>,
    #[serde(default = "default_skills_dir")]
    pub skills_dir: String,
    #[serde(default)]
    pub always_on_skills: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TierOverride {
    #[serde(default)]
    pub stable: Vec<String>,
    #[serde(default)]
    pub semi_stable: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_http_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default = "default_http_max_body")]
    pub max_body_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_http_host(),
            port: default_http_port(),
            auth_token: String::new(),
            max_body_bytes: default_http_max_body(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Callback URL; empty disables webhooks.
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: String::new(),
            timeout_secs: default_webhook_timeout(),
        }
    }
}

// ─── serde defaults ──────────────────────────────────────────────

fn default_workspace() -> PathBuf {
    PathBuf::from("./workspace")
}
fn default_state_dir() -> PathBuf {
    PathBuf::from("./state")
}
fn default_sessions_dir() -> PathBuf {
    PathBuf::from("./sessions")
}
fn default_channel_type() -> String {
    "cli".to_string()
}
fn default_provider_type() -> String {
    "anthropic-compat".to_string()
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_debounce_ms() -> u64 {
    1500
}
fn default_max_turns() -> u32 {
    25
}
fn default_agent_timeout() -> u64 {
    300
}
fn default_message_retries() -> u32 {
    2
}
fn default_message_retry_base_delay() -> f64 {
    5.0
}
fn default_api_retries() -> u32 {
    3
}
fn default_api_retry_base_delay() -> f64 {
    1.0
}
fn default_error_message() -> String {
    "something went wrong — please try again".to_string()
}
fn default_true() -> bool {
    true
}
fn default_output_truncation() -> usize {
    30_000
}
fn default_compaction_threshold() -> u64 {
    150_000
}
fn default_keep_recent() -> usize {
    10
}
fn default_compaction_model() -> String {
    "compaction".to_string()
}
fn default_compaction_prompt() -> String {
    "Summarize the conversation so far from {agent_name}'s perspective. \
     Keep concrete facts, names, open threads, and decisions. \
     Write a compact summary the conversation can continue from."
        .to_string()
}
fn default_max_image_bytes() -> usize {
    5 * 1024 * 1024
}
fn default_max_dimension() -> u32 {
    1568
}
fn default_jpeg_quality_steps() -> Vec<u8> {
    vec![85, 60, 40]
}
fn default_image_caption() -> String {
    "image".to_string()
}
fn default_too_large_msg() -> String {
    "image too large to process".to_string()
}
fn default_stt_local_endpoint() -> String {
    "http://127.0.0.1:8080/inference".to_string()
}
fn default_stt_language() -> String {
    "auto".to_string()
}
fn default_stt_ffmpeg_timeout() -> u64 {
    30
}
fn default_stt_request_timeout() -> u64 {
    60
}
fn default_stt_openai_url() -> String {
    "https://api.openai.com/v1/audio/transcriptions".to_string()
}
fn default_stt_openai_model() -> String {
    "whisper-1".to_string()
}
fn default_stt_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_voice_label() -> String {
    "voice message".to_string()
}
fn default_voice_fail_msg() -> String {
    "voice message received — transcription failed".to_string()
}
fn default_audio_label() -> String {
    "audio".to_string()
}
fn default_audio_fail_msg() -> String {
    "audio received — transcription failed".to_string()
}
fn default_doc_max_chars() -> usize {
    40_000
}
fn default_doc_max_file_bytes() -> u64 {
    10 * 1024 * 1024
}
fn default_text_extensions() -> Vec<String> {
    [
        ".txt", ".md", ".csv", ".json", ".yaml", ".yml", ".toml", ".log",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_top_k() -> usize {
    10
}
fn default_embedding_timeout() -> u64 {
    15
}
fn default_max_facts() -> usize {
    20
}
fn default_max_episodes_at_start() -> usize {
    3
}
fn default_max_dynamic_tokens() -> usize {
    1500
}
fn default_decay_rate() -> f64 {
    0.03
}
fn default_fact_format() -> String {
    "natural".to_string()
}
fn default_episode_header() -> String {
    "Recent conversations".to_string()
}
fn default_synthesis_style() -> String {
    "structured".to_string()
}
fn default_priority_facts() -> i32 {
    15
}
fn default_priority_episodes() -> i32 {
    25
}
fn default_priority_vector() -> i32 {
    35
}
fn default_priority_commitments() -> i32 {
    40
}
fn default_min_messages() -> usize {
    4
}
fn default_max_extraction_chars() -> usize {
    50_000
}
fn default_confidence_threshold() -> f64 {
    0.6
}
fn default_skills_dir() -> String {
    "skills".to_string()
}
fn default_http_host() -> String {
    "127.0.0.1".to_string()
}
fn default_http_port() -> u16 {
    8776
}
fn default_http_max_body() -> usize {
    1024 * 1024
}
fn default_webhook_timeout() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn minimal_toml() -> &'static str {
        r#"
[agent]
name = "lucy"

[models.primary]
model = "claude-sonnet-4-5"
api_key_env = "ANTHROPIC_API_KEY"
cost_per_mtok = [3.0, 15.0, 0.3, 3.75]
"#
    }

    #[test]
    fn minimal_config_loads_with_defaults() {
        let mut f = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        f.write_all(minimal_toml().as_bytes()).unwrap();
        let cfg = LucydConfig::load(f.path()).unwrap();
        assert_eq!(cfg.agent.name, "lucy");
        assert_eq!(cfg.behavior.max_turns, 25);
        assert_eq!(cfg.compaction.keep_recent, 10);
        assert_eq!(cfg.memory.recall.priority_commitments, 40);
        assert!(!cfg.memory.consolidation.enabled);
    }

    #[test]
    fn routing_falls_back_to_primary() {
        let mut f = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        f.write_all(minimal_toml().as_bytes()).unwrap();
        let cfg = LucydConfig::load(f.path()).unwrap();
        assert_eq!(cfg.route_model("telegram"), "primary");
        assert_eq!(cfg.route_model("system"), "primary");
    }

    #[test]
    fn missing_primary_model_is_rejected() {
        let mut f = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        f.write_all(b"[agent]\nname = \"lucy\"\n").unwrap();
        assert!(LucydConfig::load(f.path()).is_err());
    }
}
