//! The per-message pipeline.
//!
//! One combined ingress item in, one resolved turn out: attachment
//! normalization, session write, recall injection, the agentic loop with
//! message-level retry, post-turn persistence, delivery, webhook, and
//! the compaction bookkeeping. Every exit path resolves the HTTP future
//! (when present) and fires the webhook.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use rand::Rng;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use lucyd_agent::agentic::{run_agentic_loop, LoopObserver, LoopSettings};
use lucyd_agent::context::BuildParams;
use lucyd_channels::Attachment;
use lucyd_core::provider::CompletionResponse;
use lucyd_core::types::{ChatMessage, Content, ContentBlock, ToolResultEntry};
use lucyd_memory::consolidation::{self, SessionPass};
use lucyd_memory::recall as recall_engine;
use lucyd_memory::synthesis;

use crate::app::AppState;
use crate::monitor::TurnInfo;
use crate::webhook;

/// Sources whose replies are never delivered through the transport.
/// The agentic loop still runs — tools execute, cost is recorded, the
/// session persists; only channel side effects are suppressed.
pub const NO_CHANNEL_DELIVERY: [&str; 2] = ["system", "http"];

pub fn is_suppressed_source(source: &str) -> bool {
    NO_CHANNEL_DELIVERY.contains(&source)
}

/// One debounce-combined unit of work.
pub struct CombinedMessage {
    pub text: String,
    pub sender: String,
    pub source: String,
    pub tier: String,
    pub attachments: Vec<Attachment>,
    pub notify_meta: Option<serde_json::Value>,
    pub respond: Option<oneshot::Sender<serde_json::Value>>,
}

// ─── Pure helpers ────────────────────────────────────────────────

fn is_word(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Boundary-anchored silent-token check: a token matches only at the
/// start or end of the reply, never in the middle.
pub fn is_silent(text: &str, tokens: &[String]) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() || tokens.is_empty() {
        return false;
    }
    for token in tokens {
        if token.is_empty() {
            continue;
        }
        // Starts with token, followed by end or a non-word char
        if let Some(rest) = trimmed.strip_prefix(token.as_str()) {
            if rest.chars().next().map_or(true, |c| !is_word(c)) {
                return true;
            }
        }
        // Ends with token (trailing punctuation allowed), preceded by a
        // word boundary
        let tail = trimmed.trim_end_matches(|c: char| !is_word(c));
        if let Some(head) = tail.strip_suffix(token.as_str()) {
            if head.chars().last().map_or(true, |c| !is_word(c)) {
                return true;
            }
        }
    }
    false
}

/// Prepend a pending system warning. Returns (text, consumed).
pub fn inject_warning(text: &str, warning: &str) -> (String, bool) {
    if warning.is_empty() {
        return (text.to_string(), false);
    }
    (format!("[system: {warning}]\n\n{text}"), true)
}

/// Whether the reply goes out through the channel.
pub fn should_deliver(reply: &str, source: &str) -> bool {
    !reply.trim().is_empty() && !is_suppressed_source(source)
}

/// Two-threshold compaction: warn at 80%, compact at 100%.
pub fn should_warn_context(
    input_tokens: u64,
    compaction_threshold: u64,
    needs_compaction: bool,
    already_warned: bool,
) -> bool {
    let warning_threshold = (compaction_threshold as f64 * 0.8) as u64;
    input_tokens > warning_threshold && !needs_compaction && !already_warned
}

// ─── Monitor observer ────────────────────────────────────────────

struct MonitorObserver<'a> {
    state: &'a AppState,
    contact: &'a str,
    session_id: &'a str,
    model: &'a str,
    turn_started: std::sync::Mutex<std::time::Instant>,
}

impl<'a> MonitorObserver<'a> {
    fn new(state: &'a AppState, contact: &'a str, session_id: &'a str, model: &'a str) -> Self {
        state.monitor.begin_message();
        state
            .monitor
            .write("thinking", contact, session_id, model, 1, &[]);
        Self {
            state,
            contact,
            session_id,
            model,
            turn_started: std::sync::Mutex::new(std::time::Instant::now()),
        }
    }

    fn write(&self, phase: &str, turn: u32, tools: &[String]) {
        self.state
            .monitor
            .write(phase, self.contact, self.session_id, self.model, turn, tools);
    }
}

impl LoopObserver for MonitorObserver<'_> {
    fn on_response(&self, response: &CompletionResponse, turn: u32) {
        let duration_ms = self.turn_started.lock().unwrap().elapsed().as_millis() as u64;
        let tools: Vec<String> = response.tool_calls.iter().map(|c| c.name.clone()).collect();
        self.state.monitor.push_turn(TurnInfo {
            duration_ms,
            input_tokens: response.usage.input_tokens,
            output_tokens: response.usage.output_tokens,
            cache_read_tokens: response.usage.cache_read_tokens,
            cache_write_tokens: response.usage.cache_write_tokens,
            stop_reason: response.stop_reason.clone(),
            tools: tools.clone(),
        });
        if response.stop_reason == "tool_use" && !tools.is_empty() {
            self.write("tools", turn, &tools);
        } else {
            self.write("idle", turn, &[]);
        }
    }

    fn on_tool_results(&self, _results: &[ToolResultEntry], turn: u32) {
        *self.turn_started.lock().unwrap() = std::time::Instant::now();
        self.write("thinking", turn + 1, &[]);
    }
}

// ─── The pipeline ────────────────────────────────────────────────

/// Process one combined message end to end.
pub async fn process_message(state: &Arc<AppState>, msg: CombinedMessage) {
    let CombinedMessage {
        text,
        sender,
        source,
        tier,
        attachments,
        notify_meta,
        mut respond,
    } = msg;

    let mut resolve = |result: serde_json::Value| {
        if let Some(tx) = respond.take() {
            let _ = tx.send(result);
        }
    };

    // 1. Routing: source → model; image/voice attachments may upgrade.
    let mut model_name = state.config.route_model(&source);
    let has_images = attachments.iter().any(|a| a.is_image());
    if has_images {
        let vision = state.config.route_model("vision");
        if state.providers.contains_key(&vision) {
            model_name = vision;
        }
    }
    if attachments.iter().any(|a| a.is_audio() && a.is_voice) {
        let voice = state.config.route_model("voice");
        if state.providers.contains_key(&voice) {
            model_name = voice;
        }
    }

    let Some(provider) = state.provider(&model_name) else {
        error!(model = %model_name, source = %source, "no provider for model");
        resolve(serde_json::json!({"error": format!("no provider for model '{model_name}'")}));
        return;
    };
    let model_cfg = state.config.model(&model_name).cloned();
    let supports_vision = model_cfg.as_ref().is_some_and(|m| m.supports_vision);
    let wire_model = model_cfg
        .as_ref()
        .map(|m| m.model.clone())
        .unwrap_or_else(|| model_name.clone());
    let cost_rates = model_cfg.map(|m| m.cost_per_mtok).unwrap_or_default();

    // 2. Attachment normalization.
    let normalized = crate::attach::normalize(state, text, &attachments, supports_vision).await;
    let has_voice = normalized.has_voice;
    let image_blocks = normalized.image_blocks;
    let mut text = normalized.text;

    // 3. Session write.
    let session_arc = match state.sessions.get_or_create(&sender, &model_name) {
        Ok(arc) => arc,
        Err(e) => {
            error!(sender = %sender, error = %e, "session open failed");
            resolve(serde_json::json!({"error": e.to_string()}));
            return;
        }
    };
    let mut session = session_arc.lock().await;

    let (with_warning, consumed) = inject_warning(&text, &session.pending_system_warning);
    text = with_warning;
    if consumed {
        session.pending_system_warning = String::new();
        // Persist the cleared warning before the loop so a crash cannot
        // replay it.
        if let Err(e) = session.save_state() {
            warn!(session = %session.id, error = %e, "warning-clear checkpoint failed");
        }
    }

    let timestamp = Local::now().format("[%a, %d. %b %Y - %H:%M %Z]");
    text = format!("{timestamp}\n{text}");

    if let Err(e) = session.add_user_message(&text, &sender, &source) {
        error!(session = %session.id, error = %e, "failed to persist user message");
        resolve(serde_json::json!({"error": e.to_string(), "session_id": session.id}));
        return;
    }
    session.merge_trailing_user_messages();
    let user_msg_idx = session.messages.len() - 1;

    // 4. Transient image block injection for the API call.
    if !image_blocks.is_empty() {
        let mut blocks = image_blocks.clone();
        blocks.push(ContentBlock::Text { text: text.clone() });
        session.messages[user_msg_idx].content = Content::Blocks(blocks);
    }

    // 5. Context assembly with fresh-session recall.
    let mut recall_text = String::new();
    if session.messages.len() <= 1 {
        recall_text = state.sessions.build_recall(&sender);
        if state.config.memory.consolidation.enabled {
            if let Some(memory) = &state.memory {
                match recall_engine::session_start_context(memory, &state.config.memory.recall) {
                    Ok(context) if !context.is_empty() => {
                        if recall_text.is_empty() {
                            recall_text = context;
                        } else {
                            recall_text = format!("{recall_text}\n\n{context}");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "structured recall at session start failed");
                        if recall_text.is_empty() {
                            recall_text = "[Memory recall unavailable — background error. \
                                Use memory_search or memory_get to access memory manually.]"
                                .to_string();
                        }
                    }
                }
            }
        }
    }

    // Synthesis uses the provider routed for this message, so there is
    // no model mismatch; its cost is recorded like any other call.
    let style = state.config.memory.recall.synthesis_style.clone();
    if !recall_text.is_empty() && style != "structured" {
        let result = synthesis::synthesize_recall(&recall_text, &style, provider.as_ref()).await;
        if let Some(usage) = result.usage {
            if let Err(e) = state
                .ledger
                .record(&session.id, &wire_model, &usage, &cost_rates)
            {
                warn!(error = %e, "synthesis cost record failed");
            }
        }
        recall_text = result.text;
    }

    let tool_descs = state.registry.get_brief_descriptions();
    let skill_index = state.skills.build_index();
    let always_on = state.config.context.always_on_skills.clone();
    let skill_bodies = state.skills.get_bodies(&always_on);
    let system_blocks = state.assembler.build(&BuildParams {
        tier: &tier,
        source: &source,
        tool_descriptions: &tool_descs,
        skill_index: &skill_index,
        always_on_skills: &always_on,
        skill_bodies: Some(&skill_bodies),
        extra_dynamic: &recall_text,
        voice_reply_hint: has_voice && state.registry.has("tts"),
    });
    let fmt_system = provider.format_system(&system_blocks);

    // 6. Typing indicator.
    if state.config.behavior.typing_indicators && !is_suppressed_source(&source) {
        state.channel.send_typing(&sender).await;
    }

    // 7. Agentic loop with message-level retry on transient failures.
    let session_id = session.id.clone();
    let observer = MonitorObserver::new(state, &sender, &session_id, &wire_model);
    let tools = state.registry.get_schemas();
    let behavior = &state.config.behavior;
    let msg_count_before = session.messages.len();

    let mut attempt: u32 = 0;
    let outcome = loop {
        let settings = LoopSettings {
            max_turns: behavior.max_turns,
            max_cost: behavior.max_cost_per_message,
            timeout: Duration::from_secs(behavior.agent_timeout_secs),
            api_retries: behavior.api_retries,
            api_retry_base_delay: behavior.api_retry_base_delay_secs,
            session_id: &session_id,
            model_name: &wire_model,
            cost_rates: &cost_rates,
        };

        match run_agentic_loop(
            provider.as_ref(),
            &fmt_system,
            &mut session.messages,
            &tools,
            &state.registry,
            Some(&state.ledger),
            settings,
            Some(&observer),
        )
        .await
        {
            Ok(o) => break o,
            Err(e) if e.is_transient() && attempt < behavior.message_retries => {
                // Restore text-only content before waiting.
                if !image_blocks.is_empty() {
                    session.messages[user_msg_idx].content = Content::Text(text.clone());
                }
                let jitter: f64 = rand::thread_rng().gen_range(0.5..1.5);
                let delay =
                    behavior.message_retry_base_delay_secs * 2f64.powi(attempt as i32) * jitter;
                warn!(
                    attempt = attempt + 1,
                    retries = behavior.message_retries,
                    sender = %sender,
                    delay_s = delay,
                    error = %e,
                    "message retry after transient failure"
                );
                observer.write("retry_wait", attempt + 1, &[]);
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                if !image_blocks.is_empty() {
                    let mut blocks = image_blocks.clone();
                    blocks.push(ContentBlock::Text { text: text.clone() });
                    session.messages[user_msg_idx].content = Content::Blocks(blocks);
                }
                observer.write("thinking", attempt + 1, &[]);
                attempt += 1;
            }
            Err(e) => {
                error!(sender = %sender, error = %e, "agentic loop failed");
                if !image_blocks.is_empty() {
                    session.messages[user_msg_idx].content = Content::Text(text.clone());
                }
                // Remove the orphaned user message so the log never ends
                // on an unanswered user turn.
                if session.remove_orphaned_user_message() {
                    if let Err(e) = session.save_state() {
                        warn!(session = %session_id, error = %e, "orphan-removal checkpoint failed");
                    }
                }
                observer.write("idle", 1, &[]);
                resolve(serde_json::json!({"error": e.to_string(), "session_id": session_id}));
                if !is_suppressed_source(&source) {
                    if let Err(e) = state
                        .channel
                        .send(&sender, &state.config.behavior.error_message, None)
                        .await
                    {
                        error!(sender = %sender, error = %e, "failed to deliver error message");
                    }
                }
                webhook::fire(
                    state,
                    webhook::Payload {
                        reply: String::new(),
                        session_id: session_id.clone(),
                        sender: sender.clone(),
                        source: source.clone(),
                        silent: false,
                        tokens: serde_json::json!({"input": 0, "output": 0}),
                        notify_meta,
                    },
                )
                .await;
                return;
            }
        }
    };
    observer.write("idle", outcome.turns, &[]);

    // 8. Post-turn persistence: everything the loop appended.
    let appended: Vec<ChatMessage> = session.messages[msg_count_before..].to_vec();
    for msg in &appended {
        match msg.role {
            lucyd_core::types::Role::Assistant => session.persist_assistant_message(msg),
            lucyd_core::types::Role::ToolResults => session.persist_tool_results(&msg.results),
            lucyd_core::types::Role::User => {}
        }
    }

    // Restore text-only content so the persisted log stays compact.
    if !image_blocks.is_empty() {
        session.messages[user_msg_idx].content = Content::Text(text.clone());
    }
    session.last_input_tokens = outcome.usage.input_tokens;
    if let Err(e) = session.save_state() {
        error!(session = %session_id, error = %e, "post-turn checkpoint failed");
    }

    let mut reply = outcome.text.clone();
    if outcome.cost_limited && reply.trim().is_empty() {
        reply = "[cost limit reached — max_cost_per_message in lucyd.toml. \
                 raise or set to 0 to disable.]"
            .to_string();
    }

    let tokens = serde_json::json!({
        "input": outcome.usage.input_tokens,
        "output": outcome.usage.output_tokens,
    });

    // 9. Silent-token check.
    if is_silent(&reply, &state.config.behavior.silent_tokens) {
        info!(reply = %reply.chars().take(100).collect::<String>(), "silent reply suppressed");
        resolve(serde_json::json!({
            "reply": reply,
            "silent": true,
            "session_id": session_id,
            "tokens": tokens,
        }));
        webhook::fire(
            state,
            webhook::Payload {
                reply,
                session_id: session_id.clone(),
                sender: sender.clone(),
                source,
                silent: true,
                tokens,
                notify_meta,
            },
        )
        .await;
        finish_turn(state, &mut session).await;
        return;
    }

    resolve(serde_json::json!({
        "reply": reply,
        "session_id": session_id,
        "tokens": tokens,
    }));

    // 10. Deliver reply.
    if should_deliver(&reply, &source) {
        if let Err(e) = state.channel.send(&sender, &reply, None).await {
            error!(sender = %sender, error = %e, "failed to deliver reply");
        }
    }

    // 11. Webhook.
    webhook::fire(
        state,
        webhook::Payload {
            reply,
            session_id: session_id.clone(),
            sender: sender.clone(),
            source,
            silent: false,
            tokens,
            notify_meta,
        },
    )
    .await;

    finish_turn(state, &mut session).await;
}

/// Steps 12–14: compaction warning, pre-compaction consolidation, and
/// compaction itself.
async fn finish_turn(state: &Arc<AppState>, session: &mut lucyd_sessions::Session) {
    let threshold = state.config.compaction.threshold;
    let needs_compaction = session.needs_compaction(threshold);

    // 12. Compaction warning at 80%.
    if should_warn_context(
        session.last_input_tokens,
        threshold,
        needs_compaction,
        session.warned_about_compaction,
    ) {
        let max_context = state
            .config
            .model("primary")
            .map(|m| m.max_context_tokens)
            .unwrap_or(0);
        let pct = if max_context > 0 {
            session.last_input_tokens * 100 / max_context
        } else {
            0
        };
        session.pending_system_warning = format!(
            "context at {} tokens ({pct}% of capacity). compaction will summarize \
             older messages at {}. save anything important to memory files, then \
             continue the conversation normally.",
            session.last_input_tokens, threshold
        );
        session.warned_about_compaction = true;
        if let Err(e) = session.save_state() {
            warn!(session = %session.id, error = %e, "warning checkpoint failed");
        }
        info!(
            session = %session.id,
            tokens = session.last_input_tokens,
            "compaction warning set"
        );
    }

    // 13. Pre-compaction consolidation: extract structured data before
    // the log is rewritten. Failure never blocks compaction.
    if needs_compaction && state.config.memory.consolidation.enabled {
        if let (Some(memory), Some(primary)) = (&state.memory, state.primary_provider()) {
            let subagent = state.provider("subagent").unwrap_or_else(|| primary.clone());
            let persona = state.assembler.build_stable();
            let cfg = &state.config.memory.consolidation;
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
                memory,
            )
            .await
            {
                Ok(outcome) => {
                    if outcome.facts_added > 0 || outcome.episode_id.is_some() {
                        info!(
                            session = %session.id,
                            facts = outcome.facts_added,
                            episode = ?outcome.episode_id,
                            "pre-compaction consolidation"
                        );
                    }
                }
                Err(e) => {
                    error!(session = %session.id, error = %e, "consolidation failed, continuing without");
                }
            }
        }
    }

    // 14. Compaction.
    if needs_compaction {
        let compaction_model = &state.config.compaction.model;
        let Some(compaction_provider) = state
            .provider(compaction_model)
            .or_else(|| state.primary_provider())
        else {
            warn!("no provider available for compaction");
            return;
        };
        let prompt = state
            .config
            .compaction
            .prompt
            .replace("{agent_name}", &state.config.agent.name);
        if let Err(e) = state
            .sessions
            .compact_session(
                session,
                compaction_provider.as_ref(),
                &prompt,
                state.config.compaction.keep_recent,
            )
            .await
        {
            error!(session = %session.id, error = %e, "compaction failed");
        }
    }

    debug!(session = %session.id, "turn finished");
}
