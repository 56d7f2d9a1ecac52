//! End-to-end pipeline scenarios with a scripted provider and a mock
//! channel: happy path, silent heartbeat, transient-failure recovery,
//! fatal failure, the compaction ladder, and dispatcher debouncing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};

use lucyd_agent::ToolRegistry;
use lucyd_channels::{Channel, ChannelError, InboundMessage};
use lucyd_core::provider::{CompletionResponse, Provider, ProviderError};
use lucyd_core::types::{ChatMessage, Role, SystemBlock, Usage};
use lucyd_core::LucydConfig;

use lucyd_daemon::app::AppState;
use lucyd_daemon::dispatch::{Dispatcher, Ingress};
use lucyd_daemon::pipeline::{self, CombinedMessage};

// ─── Mocks ───────────────────────────────────────────────────────

struct MockChannel {
    sends: Mutex<Vec<(String, String)>>,
    typing: Mutex<Vec<String>>,
}

impl MockChannel {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sends: Mutex::new(Vec::new()),
            typing: Mutex::new(Vec::new()),
        })
    }

    fn sends(&self) -> Vec<(String, String)> {
        self.sends.lock().unwrap().clone()
    }

    fn typing_count(&self) -> usize {
        self.typing.lock().unwrap().len()
    }
}

#[async_trait]
impl Channel for MockChannel {
    fn name(&self) -> &str {
        "mock"
    }

    async fn connect(&self) -> Result<(), ChannelError> {
        Ok(())
    }

    fn receive(&self) -> BoxStream<'static, InboundMessage> {
        futures_util::stream::empty().boxed()
    }

    async fn send(
        &self,
        target: &str,
        text: &str,
        _attachments: Option<&[String]>,
    ) -> Result<(), ChannelError> {
        self.sends
            .lock()
            .unwrap()
            .push((target.to_string(), text.to_string()));
        Ok(())
    }

    async fn send_typing(&self, target: &str) {
        self.typing.lock().unwrap().push(target.to_string());
    }
}

struct ScriptedProvider {
    script: Mutex<Vec<Result<CompletionResponse, ProviderError>>>,
    calls: AtomicU32,
}

impl ScriptedProvider {
    fn new(script: Vec<Result<CompletionResponse, ProviderError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            calls: AtomicU32::new(0),
        })
    }

    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn format_system(&self, _blocks: &[SystemBlock]) -> serde_json::Value {
        serde_json::Value::Null
    }

    fn format_messages(&self, _messages: &[ChatMessage]) -> serde_json::Value {
        serde_json::Value::Null
    }

    async fn complete(
        &self,
        _system: &serde_json::Value,
        _messages: &serde_json::Value,
        _tools: &[serde_json::Value],
    ) -> Result<CompletionResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().unwrap();
        if script.is_empty() {
            return Ok(reply("script exhausted", 100));
        }
        script.remove(0)
    }
}

fn reply(text: &str, input_tokens: u64) -> CompletionResponse {
    CompletionResponse {
        text: text.to_string(),
        stop_reason: "end_turn".to_string(),
        tool_calls: Vec::new(),
        usage: Usage {
            input_tokens,
            output_tokens: 20,
            ..Default::default()
        },
    }
}

// ─── Harness ─────────────────────────────────────────────────────

struct Harness {
    state: Arc<AppState>,
    channel: Arc<MockChannel>,
    provider: Arc<ScriptedProvider>,
    tx: mpsc::Sender<Ingress>,
    _dir: tempfile::TempDir,
}

fn harness_with(
    script: Vec<Result<CompletionResponse, ProviderError>>,
    patch: impl FnOnce(&mut serde_json::Value),
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut raw = serde_json::json!({
        "agent": {
            "name": "lucy",
            "workspace": dir.path().join("workspace"),
            "state_dir": dir.path().join("state"),
            "sessions_dir": dir.path().join("sessions"),
        },
        "models": {
            "primary": {
                "model": "test-model",
                "cost_per_mtok": [3.0, 15.0, 0.3, 3.75],
                "max_context_tokens": 200000,
            },
        },
        "behavior": {
            "debounce_ms": 100,
            "message_retry_base_delay_secs": 0.01,
            "api_retry_base_delay_secs": 0.01,
            "silent_tokens": ["HEARTBEAT_OK"],
        },
    });
    patch(&mut raw);
    let config: LucydConfig = serde_json::from_value(raw).unwrap();
    std::fs::create_dir_all(&config.agent.workspace).unwrap();

    let channel = MockChannel::new();
    let provider = ScriptedProvider::new(script);
    let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
    providers.insert("primary".to_string(), provider.clone());

    let (tx, _rx) = mpsc::channel(100);
    let state = AppState::build(
        config,
        providers,
        channel.clone(),
        ToolRegistry::new(10_000),
        None,
        tx.clone(),
    )
    .unwrap();

    Harness {
        state,
        channel,
        provider,
        tx,
        _dir: dir,
    }
}

fn harness(script: Vec<Result<CompletionResponse, ProviderError>>) -> Harness {
    harness_with(script, |_| {})
}

fn message(text: &str, sender: &str, source: &str) -> CombinedMessage {
    CombinedMessage {
        text: text.to_string(),
        sender: sender.to_string(),
        source: source.to_string(),
        tier: "full".to_string(),
        attachments: Vec::new(),
        notify_meta: None,
        respond: None,
    }
}

// ─── Scenarios ───────────────────────────────────────────────────

#[tokio::test]
async fn happy_path_delivers_reply_and_records_cost() {
    let h = harness(vec![Ok(reply("hi!", 500))]);

    pipeline::process_message(&h.state, message("hello", "alice", "cli")).await;

    assert_eq!(h.channel.sends(), vec![("alice".to_string(), "hi!".to_string())]);
    assert_eq!(h.channel.typing_count(), 1);
    assert!(h.state.ledger.today_total() > 0.0);

    let session = h.state.sessions.get_or_create("alice", "primary").unwrap();
    let s = session.lock().await;
    assert_eq!(s.messages.len(), 2);
    assert_eq!(s.messages[0].role, Role::User);
    assert!(s.messages[0].text().contains("hello"));
    assert_eq!(s.messages[1].text(), "hi!");
    assert_eq!(s.last_input_tokens, 500);
}

#[tokio::test]
async fn silent_heartbeat_is_not_delivered() {
    let h = harness(vec![Ok(reply("HEARTBEAT_OK", 100))]);

    pipeline::process_message(&h.state, message("heartbeat", "system", "system")).await;

    // No delivery, no typing indicator — but the session persisted and
    // the cost was recorded.
    assert!(h.channel.sends().is_empty());
    assert_eq!(h.channel.typing_count(), 0);
    assert!(h.state.ledger.today_total() > 0.0);

    let session = h.state.sessions.get_or_create("system", "primary").unwrap();
    assert_eq!(session.lock().await.messages.len(), 2);
}

#[tokio::test]
async fn transient_failure_retries_and_resolves_http_future() {
    let h = harness(vec![
        Err(ProviderError::Timeout { ms: 1000 }),
        Ok(reply("computed", 300)),
    ]);

    let (resp_tx, resp_rx) = oneshot::channel();
    let mut msg = message("compute", "apiuser", "http");
    msg.respond = Some(resp_tx);

    pipeline::process_message(&h.state, msg).await;

    let result = resp_rx.await.unwrap();
    assert_eq!(result["reply"], "computed");
    assert!(result["session_id"].is_string());
    assert_eq!(result["tokens"]["input"], 300);
    // HTTP source never delivers through the channel
    assert!(h.channel.sends().is_empty());
    // api_retries covers the transient error inside the loop
    assert_eq!(h.provider.call_count(), 2);

    // No orphan, no consecutive user messages
    let session = h.state.sessions.get_or_create("apiuser", "primary").unwrap();
    let s = session.lock().await;
    assert_eq!(s.messages.len(), 2);
    assert_eq!(s.messages[1].role, Role::Assistant);
}

#[tokio::test]
async fn fatal_failure_removes_orphan_and_sends_error_text() {
    let h = harness(vec![Err(ProviderError::Api {
        status: 401,
        message: "bad key".to_string(),
    })]);

    pipeline::process_message(&h.state, message("hello", "alice", "cli")).await;

    // Generic error delivered to the user, not the raw failure
    let sends = h.channel.sends();
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].1, h.state.config.behavior.error_message);

    // The orphaned user message is gone — the log never ends on an
    // unanswered user turn.
    let session = h.state.sessions.get_or_create("alice", "primary").unwrap();
    assert!(session.lock().await.messages.is_empty());
}

#[tokio::test]
async fn fatal_failure_on_suppressed_source_stays_quiet() {
    let h = harness(vec![Err(ProviderError::Api {
        status: 400,
        message: "bad request".to_string(),
    })]);

    let (resp_tx, resp_rx) = oneshot::channel();
    let mut msg = message("task", "system", "http");
    msg.respond = Some(resp_tx);
    pipeline::process_message(&h.state, msg).await;

    let result = resp_rx.await.unwrap();
    assert!(result["error"].is_string());
    assert!(h.channel.sends().is_empty());
}

#[tokio::test]
async fn warning_fires_at_80_percent_and_injects_next_turn() {
    let h = harness_with(
        vec![Ok(reply("first", 900)), Ok(reply("second", 100))],
        |raw| {
            raw["compaction"] = serde_json::json!({"threshold": 1000, "keep_recent": 10});
        },
    );

    pipeline::process_message(&h.state, message("one", "alice", "cli")).await;
    {
        let session = h.state.sessions.get_or_create("alice", "primary").unwrap();
        let s = session.lock().await;
        assert!(s.pending_system_warning.contains("context at 900 tokens"));
        assert!(s.warned_about_compaction);
    }

    pipeline::process_message(&h.state, message("two", "alice", "cli")).await;
    let session = h.state.sessions.get_or_create("alice", "primary").unwrap();
    let s = session.lock().await;
    // Warning consumed: injected into the second user message, cleared
    // from the session, not set again (already warned).
    assert!(s.messages[2].text().contains("[system: context at 900 tokens"));
    assert!(s.pending_system_warning.is_empty());
}

#[tokio::test]
async fn compaction_rewrites_log_and_increments_count() {
    let h = harness_with(
        // Turn reply pushes past the threshold; next call summarizes.
        vec![Ok(reply("long answer", 500)), Ok(reply("the summary", 10))],
        |raw| {
            raw["compaction"] = serde_json::json!({"threshold": 400, "keep_recent": 1});
        },
    );

    pipeline::process_message(&h.state, message("hello", "alice", "cli")).await;

    let session = h.state.sessions.get_or_create("alice", "primary").unwrap();
    let s = session.lock().await;
    assert_eq!(s.compaction_count, 1);
    assert!(s.messages[0].text().starts_with("[Conversation summary]"));
    assert!(s.messages[0].text().contains("the summary"));
    assert_eq!(s.messages.last().unwrap().text(), "long answer");
    // Compaction used the provider a second time
    assert_eq!(h.provider.call_count(), 2);
}

#[tokio::test]
async fn dispatcher_combines_rapid_messages_from_one_sender() {
    let h = harness(vec![Ok(reply("combined reply", 100))]);

    let (tx, rx) = mpsc::channel(100);
    let dispatcher = Dispatcher::new(h.state.clone(), rx);
    let task = tokio::spawn(dispatcher.run());

    for text in ["first line", "second line"] {
        tx.send(Ingress::Inbound(InboundMessage {
            text: text.to_string(),
            sender: "alice".to_string(),
            timestamp: 1000.0,
            source: "cli".to_string(),
            quote: None,
            attachments: None,
        }))
        .await
        .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    tx.send(Ingress::Shutdown).await.unwrap();
    task.await.unwrap();

    // One combined pipeline run, one reply
    assert_eq!(h.provider.call_count(), 1);
    assert_eq!(h.channel.sends().len(), 1);

    let session = h.state.sessions.get_or_create("alice", "primary").unwrap();
    let s = session.lock().await;
    let user_text = s.messages[0].text();
    assert!(user_text.contains("first line\nsecond line"));
}

#[tokio::test]
async fn dispatcher_reset_closes_session() {
    let h = harness(vec![Ok(reply("hi", 100))]);

    pipeline::process_message(&h.state, message("hello", "alice", "cli")).await;
    assert_eq!(h.state.sessions.active_count(), 1);

    let (tx, rx) = mpsc::channel(100);
    let task = tokio::spawn(Dispatcher::new(h.state.clone(), rx).run());
    let reset =
        lucyd_daemon::dispatch::parse_control(&serde_json::json!({"type": "reset", "sender": "alice"}))
            .unwrap();
    tx.send(Ingress::Control(reset)).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    tx.send(Ingress::Shutdown).await.unwrap();
    task.await.unwrap();

    assert_eq!(h.state.sessions.active_count(), 0);
}

#[tokio::test]
async fn oversized_png_becomes_text_fallback() {
    // Vision-capable model, but an image byte cap no PNG can meet: the
    // fallback sentence is injected and the turn proceeds on text alone.
    let h = harness_with(vec![Ok(reply("I see no image", 100))], |raw| {
        raw["models"]["primary"]["supports_vision"] = serde_json::json!(true);
        raw["vision"] = serde_json::json!({"max_image_bytes": 64});
    });

    let img_path = h._dir.path().join("big.png");
    {
        use image::{DynamicImage, ImageFormat, RgbImage};
        let img = DynamicImage::ImageRgb8(RgbImage::from_fn(256, 256, |x, y| {
            image::Rgb([(x % 251) as u8, (y % 241) as u8, ((x * y) % 239) as u8])
        }));
        img.save_with_format(&img_path, ImageFormat::Png).unwrap();
    }

    let mut msg = message("what is this?", "alice", "cli");
    msg.attachments = vec![lucyd_channels::Attachment {
        content_type: "image/png".to_string(),
        local_path: img_path.to_string_lossy().to_string(),
        filename: "big.png".to_string(),
        size: 0,
        is_voice: false,
    }];
    pipeline::process_message(&h.state, msg).await;

    // The provider was reached once — the turn was not aborted.
    assert_eq!(h.provider.call_count(), 1);
    assert_eq!(h.channel.sends().len(), 1);

    let session = h.state.sessions.get_or_create("alice", "primary").unwrap();
    let s = session.lock().await;
    let user_text = s.messages[0].text();
    assert!(user_text.contains("image too large to process"));
    // No image blocks survive in the persisted log.
    assert!(matches!(
        s.messages[0].content,
        lucyd_core::types::Content::Text(_)
    ));
}

#[tokio::test]
async fn unreadable_image_becomes_text_fallback() {
    let h = harness_with(vec![Ok(reply("ok", 100))], |raw| {
        raw["models"]["primary"]["supports_vision"] = serde_json::json!(true);
    });

    let mut msg = message("look", "alice", "cli");
    msg.attachments = vec![lucyd_channels::Attachment {
        content_type: "image/jpeg".to_string(),
        local_path: "/nonexistent/gone.jpg".to_string(),
        filename: "gone.jpg".to_string(),
        size: 0,
        is_voice: false,
    }];
    pipeline::process_message(&h.state, msg).await;

    let session = h.state.sessions.get_or_create("alice", "primary").unwrap();
    let s = session.lock().await;
    assert!(s.messages[0].text().contains("could not read file"));
}

#[tokio::test]
async fn queue_tx_field_reflects_depth() {
    let h = harness(vec![]);
    // Nothing queued through the held sender — depth is zero.
    assert_eq!(h.state.queue_depth(), 0);
    let _ = &h.tx;
}
