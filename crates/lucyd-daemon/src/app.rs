//! Shared daemon state and component wiring.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use lucyd_agent::{ContextAssembler, SkillLoader, ToolRegistry};
use lucyd_channels::Channel;
use lucyd_core::provider::Provider;
use lucyd_core::LucydConfig;
use lucyd_cost::CostLedger;
use lucyd_memory::consolidation::{self, SessionPass};
use lucyd_memory::embed::EmbeddingClient;
use lucyd_memory::MemoryStore;
use lucyd_sessions::{Session, SessionCloseHook, SessionManager};

use crate::dispatch::Ingress;
use crate::monitor::MonitorWriter;

/// Contacts tracked for the reaction tool's timestamp lookup.
const CONTACT_TS_CAP: usize = 1000;

/// Everything the pipeline and the HTTP views share.
pub struct AppState {
    pub config: Arc<LucydConfig>,
    pub providers: Arc<HashMap<String, Arc<dyn Provider>>>,
    pub channel: Arc<dyn Channel>,
    pub sessions: Arc<SessionManager>,
    pub memory: Option<Arc<MemoryStore>>,
    pub assembler: Arc<ContextAssembler>,
    pub skills: Arc<SkillLoader>,
    pub registry: Arc<ToolRegistry>,
    pub ledger: Arc<CostLedger>,
    pub monitor: MonitorWriter,
    pub http_client: reqwest::Client,
    pub started_at: std::time::Instant,
    pub queue_tx: mpsc::Sender<Ingress>,
    /// Per-sender last-inbound timestamp (ms), LRU-capped. Written by the
    /// dispatcher; read by reaction-style tools the host registers.
    pub contact_timestamps: Mutex<LruCache<String, i64>>,
}

/// Open the memory store from config; None when no db_path is set.
pub fn open_memory(config: &LucydConfig) -> anyhow::Result<Option<Arc<MemoryStore>>> {
    let Some(path) = &config.memory.db_path else {
        return Ok(None);
    };
    let embedding = if config.memory.embedding.is_configured() {
        let api_key = std::env::var(&config.memory.embedding.api_key_env).unwrap_or_default();
        Some(EmbeddingClient::new(
            &config.memory.embedding.base_url,
            &config.memory.embedding.model,
            &config.memory.embedding.provider,
            &api_key,
            config.memory.embedding.timeout_secs,
        ))
    } else {
        None
    };
    Ok(Some(Arc::new(MemoryStore::open(
        path,
        embedding,
        config.memory.top_k,
    )?)))
}

impl AppState {
    /// Wire all components from config. `registry` and `memory` are
    /// handed in already built so hosts (and tests) can add their own
    /// tools over the store.
    pub fn build(
        config: LucydConfig,
        providers: HashMap<String, Arc<dyn Provider>>,
        channel: Arc<dyn Channel>,
        registry: ToolRegistry,
        memory: Option<Arc<MemoryStore>>,
        queue_tx: mpsc::Sender<Ingress>,
    ) -> anyhow::Result<Arc<Self>> {
        let config = Arc::new(config);
        std::fs::create_dir_all(config.state_dir()).context("create state dir")?;

        let sessions = Arc::new(SessionManager::new(&config.sessions_dir())?);
        let ledger = Arc::new(CostLedger::open(&config.cost_db())?);

        let assembler = Arc::new(ContextAssembler::new(
            config.agent.workspace.clone(),
            config.context.stable_files.clone(),
            config.context.semi_stable_files.clone(),
            config.context.tiers.clone(),
        ));

        let skills = Arc::new(SkillLoader::new(
            &config.agent.workspace,
            &config.context.skills_dir,
        ));
        skills.scan();

        let monitor = MonitorWriter::new(config.state_dir().join("monitor.json"));
        let providers = Arc::new(providers);

        let state = Arc::new(Self {
            config: Arc::clone(&config),
            providers: Arc::clone(&providers),
            channel,
            sessions: Arc::clone(&sessions),
            memory: memory.clone(),
            assembler: Arc::clone(&assembler),
            skills,
            registry: Arc::new(registry),
            ledger,
            monitor,
            http_client: reqwest::Client::new(),
            started_at: std::time::Instant::now(),
            queue_tx,
            contact_timestamps: Mutex::new(LruCache::new(
                NonZeroUsize::new(CONTACT_TS_CAP).expect("nonzero cap"),
            )),
        });

        // Consolidation runs on session close, before archival, so it
        // still sees the full log.
        if config.memory.consolidation.enabled {
            if let Some(memory) = memory {
                sessions.on_close(Arc::new(ConsolidateOnClose {
                    memory,
                    providers,
                    config,
                    assembler,
                }));
            }
        }

        Ok(state)
    }

    pub fn provider(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    /// The primary provider; wiring guarantees it exists at startup.
    pub fn primary_provider(&self) -> Option<Arc<dyn Provider>> {
        self.provider("primary")
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_tx.max_capacity() - self.queue_tx.capacity()
    }

    pub fn build_status(&self) -> serde_json::Value {
        serde_json::json!({
            "status": "ok",
            "pid": std::process::id(),
            "uptime_seconds": self.started_at.elapsed().as_secs(),
            "channel": self.channel.name(),
            "models": self.providers.keys().collect::<Vec<_>>(),
            "active_sessions": self.sessions.active_count(),
            "today_cost": (self.ledger.today_total() * 10_000.0).round() / 10_000.0,
            "queue_depth": self.queue_depth(),
            "tracked_contacts": self.contact_timestamps.lock().unwrap().len(),
        })
    }
}

/// Close hook: consolidate the session's unprocessed tail into the
/// memory store. Failures are logged and swallowed — archival proceeds.
struct ConsolidateOnClose {
    memory: Arc<MemoryStore>,
    providers: Arc<HashMap<String, Arc<dyn Provider>>>,
    config: Arc<LucydConfig>,
    assembler: Arc<ContextAssembler>,
}

#[async_trait]
impl SessionCloseHook for ConsolidateOnClose {
    async fn on_close(&self, session: &Session) {
        let Some(primary) = self.providers.get("primary") else {
            warn!("consolidation on close skipped: no primary provider");
            return;
        };
        let subagent = self.providers.get("subagent").unwrap_or(primary);
        let persona = self.assembler.build_stable();
        let cfg = &self.config.memory.consolidation;

        let pass = SessionPass {
            session_id: &session.id,
            messages: &session.messages,
            compaction_count: session.compaction_count,
            min_messages: cfg.min_messages,
            max_extraction_chars: cfg.max_extraction_chars,
            confidence_threshold: cfg.confidence_threshold,
        };
        match consolidation::consolidate_session(
            pass,
            subagent.as_ref(),
            primary.as_ref(),
            &persona,
            &self.memory,
        )
        .await
        {
            Ok(outcome) => {
                if outcome.facts_added > 0 || outcome.episode_id.is_some() {
                    info!(
                        session = %session.id,
                        facts = outcome.facts_added,
                        episode = ?outcome.episode_id,
                        "consolidated on close"
                    );
                }
            }
            Err(e) => error!(session = %session.id, error = %e, "consolidation on close failed"),
        }
    }
}
