//! The agentic loop — turn-by-turn tool-call resolution.
//!
//! Flow: completion → if tool_use → execute tools → append results →
//! completion → repeat. Stops on a terminal stop reason, max turns,
//! the per-message cost ceiling, or the overall deadline.
//!
//! Provider calls are retried here only at the per-call level
//! (`api_retries`, transient errors only); whole-message retries belong
//! to the pipeline.

use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, warn};

use lucyd_core::provider::{CompletionResponse, Provider, ProviderError};
use lucyd_core::types::{ChatMessage, ToolResultEntry, Usage};
use lucyd_cost::CostLedger;

use crate::error::AgentError;
use crate::registry::ToolRegistry;

/// Per-invocation knobs, threaded in from config by the pipeline.
pub struct LoopSettings<'a> {
    pub max_turns: u32,
    /// 0.0 disables the cost ceiling.
    pub max_cost: f64,
    pub timeout: Duration,
    pub api_retries: u32,
    pub api_retry_base_delay: f64,
    pub session_id: &'a str,
    pub model_name: &'a str,
    pub cost_rates: &'a [f64],
}

/// Observer callbacks for progress reporting (monitor.json etc).
pub trait LoopObserver: Send + Sync {
    fn on_response(&self, _response: &CompletionResponse, _turn: u32) {}
    fn on_tool_results(&self, _results: &[ToolResultEntry], _turn: u32) {}
}

/// Final state of one loop invocation. `usage` is the last response's
/// usage (what the session tracks for compaction); `total_usage` sums
/// all turns.
#[derive(Debug)]
pub struct LoopOutcome {
    pub text: String,
    pub stop_reason: String,
    pub usage: Usage,
    pub total_usage: Usage,
    pub cost_limited: bool,
    pub turns: u32,
}

/// Drive the tool loop to completion, appending every assistant and
/// tool-results message to `messages` in place.
#[allow(clippy::too_many_arguments)]
pub async fn run_agentic_loop(
    provider: &dyn Provider,
    system: &serde_json::Value,
    messages: &mut Vec<ChatMessage>,
    tools: &[serde_json::Value],
    registry: &ToolRegistry,
    ledger: Option<&CostLedger>,
    settings: LoopSettings<'_>,
    observer: Option<&dyn LoopObserver>,
) -> Result<LoopOutcome, AgentError> {
    let deadline = Instant::now() + settings.timeout;
    let mut total_usage = Usage::default();
    let mut total_cost = 0.0;
    let mut last: Option<CompletionResponse> = None;

    for turn in 1..=settings.max_turns {
        let Some(remaining) = deadline.checked_duration_since(Instant::now()).filter(|d| !d.is_zero()) else {
            warn!(turn, "agentic loop deadline expired");
            return finish_with(last, messages, total_usage, false, turn, "timeout");
        };

        let fmt_messages = provider.format_messages(messages);
        let response = complete_with_retry(
            provider,
            system,
            &fmt_messages,
            tools,
            remaining,
            settings.api_retries,
            settings.api_retry_base_delay,
        )
        .await?;

        total_usage.accumulate(&response.usage);
        if let Some(ledger) = ledger {
            match ledger.record(
                settings.session_id,
                settings.model_name,
                &response.usage,
                settings.cost_rates,
            ) {
                Ok(cost) => total_cost += cost,
                Err(e) => warn!(error = %e, "cost record failed"),
            }
        } else {
            total_cost += lucyd_cost::compute_cost(&response.usage, settings.cost_rates);
        }

        if let Some(obs) = observer {
            obs.on_response(&response, turn);
        }

        let cost_limited = settings.max_cost > 0.0 && total_cost >= settings.max_cost;

        if response.stop_reason == "tool_use" && !response.tool_calls.is_empty() && !cost_limited {
            messages.push(ChatMessage {
                role: lucyd_core::types::Role::Assistant,
                content: lucyd_core::types::Content::Text(response.text.clone()),
                tool_calls: response.tool_calls.clone(),
                results: Vec::new(),
            });

            let mut results = Vec::with_capacity(response.tool_calls.len());
            for call in &response.tool_calls {
                let (content, is_error) = registry.execute(&call.name, call.arguments.clone()).await;
                results.push(ToolResultEntry {
                    tool_use_id: call.id.clone(),
                    content,
                    is_error,
                });
            }
            messages.push(ChatMessage::tool_results(results.clone()));
            if let Some(obs) = observer {
                obs.on_tool_results(&results, turn);
            }

            last = Some(response);
            continue;
        }

        // Terminal: plain text, a non-tool stop reason, or the cost
        // ceiling cutting the conversation short.
        messages.push(ChatMessage::assistant(response.text.clone(), Vec::new()));
        info!(
            turn,
            stop_reason = %response.stop_reason,
            cost_limited,
            "agentic loop complete"
        );
        return Ok(LoopOutcome {
            text: response.text.clone(),
            stop_reason: response.stop_reason.clone(),
            usage: response.usage,
            total_usage,
            cost_limited,
            turns: turn,
        });
    }

    warn!(max_turns = settings.max_turns, "agentic loop hit max turns");
    finish_with(last, messages, total_usage, false, settings.max_turns, "max_turns")
}

fn finish_with(
    last: Option<CompletionResponse>,
    messages: &mut Vec<ChatMessage>,
    total_usage: Usage,
    cost_limited: bool,
    turns: u32,
    stop_reason: &str,
) -> Result<LoopOutcome, AgentError> {
    let Some(response) = last else {
        return Err(AgentError::NoResponse);
    };
    messages.push(ChatMessage::assistant(response.text.clone(), Vec::new()));
    Ok(LoopOutcome {
        text: response.text,
        stop_reason: stop_reason.to_string(),
        usage: response.usage,
        total_usage,
        cost_limited,
        turns,
    })
}

/// One completion with per-call transient retries and the loop deadline
/// applied to each attempt.
async fn complete_with_retry(
    provider: &dyn Provider,
    system: &serde_json::Value,
    messages: &serde_json::Value,
    tools: &[serde_json::Value],
    remaining: Duration,
    api_retries: u32,
    base_delay: f64,
) -> Result<CompletionResponse, AgentError> {
    let deadline = Instant::now() + remaining;
    let mut attempt = 0u32;
    loop {
        let left = deadline
            .checked_duration_since(Instant::now())
            .filter(|d| !d.is_zero())
            .ok_or(AgentError::Provider(ProviderError::Timeout {
                ms: remaining.as_millis() as u64,
            }))?;

        let result = tokio::time::timeout(left, provider.complete(system, messages, tools)).await;
        let err = match result {
            Ok(Ok(response)) => return Ok(response),
            Ok(Err(e)) => e,
            Err(_) => ProviderError::Timeout {
                ms: left.as_millis() as u64,
            },
        };

        if !err.is_transient() || attempt >= api_retries {
            return Err(AgentError::Provider(err));
        }

        let jitter: f64 = rand::thread_rng().gen_range(0.5..1.5);
        let delay = base_delay * 2f64.powi(attempt as i32) * jitter;
        debug!(
            attempt = attempt + 1,
            retries = api_retries,
            delay_s = delay,
            error = %err,
            "transient provider error, retrying"
        );
        tokio::time::sleep(Duration::from_secs_f64(delay)).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use lucyd_core::types::{SystemBlock, ToolCall};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    /// Provider that replays a fixed script of responses.
    struct ScriptedProvider {
        script: Mutex<Vec<Result<CompletionResponse, ProviderError>>>,
        calls: AtomicU32,
    }

    impl ScriptedProvider {
        fn new(script: Vec<Result<CompletionResponse, ProviderError>>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }
        fn format_system(&self, _b: &[SystemBlock]) -> serde_json::Value {
            serde_json::Value::Null
        }
        fn format_messages(&self, _m: &[ChatMessage]) -> serde_json::Value {
            serde_json::Value::Null
        }
        async fn complete(
            &self,
            _s: &serde_json::Value,
            _m: &serde_json::Value,
            _t: &[serde_json::Value],
        ) -> Result<CompletionResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                return Err(ProviderError::Unavailable("script exhausted".to_string()));
            }
            script.remove(0)
        }
    }

    fn text_response(text: &str) -> CompletionResponse {
        CompletionResponse {
            text: text.to_string(),
            stop_reason: "end_turn".to_string(),
            tool_calls: Vec::new(),
            usage: Usage {
                input_tokens: 500,
                output_tokens: 20,
                ..Default::default()
            },
        }
    }

    fn tool_response(name: &str) -> CompletionResponse {
        CompletionResponse {
            text: String::new(),
            stop_reason: "tool_use".to_string(),
            tool_calls: vec![ToolCall {
                id: "call_1".to_string(),
                name: name.to_string(),
                arguments: serde_json::json!({"text": "ping"}),
            }],
            usage: Usage {
                input_tokens: 400,
                output_tokens: 15,
                ..Default::default()
            },
        }
    }

    struct Echo;
    #[async_trait]
    impl crate::registry::ToolHandler for Echo {
        async fn call(&self, args: serde_json::Value) -> Result<String, String> {
            Ok(format!("echo:{}", args["text"].as_str().unwrap_or("")))
        }
    }

    fn registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new(1000);
        reg.register_many(vec![crate::registry::ToolDef {
            name: "echo".to_string(),
            description: "Echo.".to_string(),
            input_schema: serde_json::json!({"type": "object"}),
            handler: Arc::new(Echo),
        }]);
        reg
    }

    fn settings<'a>() -> LoopSettings<'a> {
        LoopSettings {
            max_turns: 10,
            max_cost: 0.0,
            timeout: Duration::from_secs(30),
            api_retries: 2,
            api_retry_base_delay: 0.01,
            session_id: "s1",
            model_name: "test-model",
            cost_rates: &[3.0, 15.0],
        }
    }

    #[tokio::test]
    async fn plain_reply_appends_one_assistant_message() {
        let provider = ScriptedProvider::new(vec![Ok(text_response("hi!"))]);
        let mut messages = vec![ChatMessage::user("hello")];
        let outcome = run_agentic_loop(
            &provider,
            &serde_json::Value::Null,
            &mut messages,
            &[],
            &registry(),
            None,
            settings(),
            None,
        )
        .await
        .unwrap();

        assert_eq!(outcome.text, "hi!");
        assert_eq!(outcome.turns, 1);
        assert!(!outcome.cost_limited);
        assert_eq!(messages.len(), 2);
    }

    #[tokio::test]
    async fn tool_turn_appends_assistant_and_results() {
        let provider = ScriptedProvider::new(vec![
            Ok(tool_response("echo")),
            Ok(text_response("done")),
        ]);
        let mut messages = vec![ChatMessage::user("run the tool")];
        let outcome = run_agentic_loop(
            &provider,
            &serde_json::Value::Null,
            &mut messages,
            &[],
            &registry(),
            None,
            settings(),
            None,
        )
        .await
        .unwrap();

        assert_eq!(outcome.text, "done");
        assert_eq!(outcome.turns, 2);
        // user, assistant(tool_use), tool_results, assistant
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[2].results[0].content, "echo:ping");
        assert_eq!(messages[2].results[0].tool_use_id, "call_1");
    }

    #[tokio::test]
    async fn transient_error_is_retried_then_succeeds() {
        let provider = ScriptedProvider::new(vec![
            Err(ProviderError::Api {
                status: 529,
                message: "overloaded".to_string(),
            }),
            Ok(text_response("recovered")),
        ]);
        let mut messages = vec![ChatMessage::user("x")];
        let outcome = run_agentic_loop(
            &provider,
            &serde_json::Value::Null,
            &mut messages,
            &[],
            &registry(),
            None,
            settings(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(outcome.text, "recovered");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fatal_error_is_not_retried() {
        let provider = ScriptedProvider::new(vec![Err(ProviderError::Api {
            status: 401,
            message: "bad key".to_string(),
        })]);
        let mut messages = vec![ChatMessage::user("x")];
        let err = run_agentic_loop(
            &provider,
            &serde_json::Value::Null,
            &mut messages,
            &[],
            &registry(),
            None,
            settings(),
            None,
        )
        .await
        .unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cost_ceiling_sets_cost_limited() {
        let provider = ScriptedProvider::new(vec![
            Ok(tool_response("echo")),
            Ok(text_response("unreachable")),
        ]);
        let mut messages = vec![ChatMessage::user("x")];
        let mut s = settings();
        // First response costs 400*3 + 15*15 per MTok ≈ $0.0014 — ceiling
        // below that trips immediately.
        s.max_cost = 0.000001;
        let outcome = run_agentic_loop(
            &provider,
            &serde_json::Value::Null,
            &mut messages,
            &[],
            &registry(),
            None,
            s,
            None,
        )
        .await
        .unwrap();
        assert!(outcome.cost_limited);
        assert_eq!(outcome.turns, 1);
        // Tool was never executed — the loop stopped at the ceiling
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn max_turns_returns_last_response() {
        let script: Vec<_> = (0..10).map(|_| Ok(tool_response("echo"))).collect();
        let provider = ScriptedProvider::new(script);
        let mut messages = vec![ChatMessage::user("x")];
        let mut s = settings();
        s.max_turns = 3;
        let outcome = run_agentic_loop(
            &provider,
            &serde_json::Value::Null,
            &mut messages,
            &[],
            &registry(),
            None,
            s,
            None,
        )
        .await
        .unwrap();
        assert_eq!(outcome.stop_reason, "max_turns");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    struct CountingObserver {
        responses: AtomicU32,
        tool_rounds: AtomicU32,
    }

    impl LoopObserver for CountingObserver {
        fn on_response(&self, _r: &CompletionResponse, _turn: u32) {
            self.responses.fetch_add(1, Ordering::SeqCst);
        }
        fn on_tool_results(&self, _r: &[ToolResultEntry], _turn: u32) {
            self.tool_rounds.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn observer_sees_every_turn() {
        let provider = ScriptedProvider::new(vec![
            Ok(tool_response("echo")),
            Ok(tool_response("echo")),
            Ok(text_response("fin")),
        ]);
        let observer = CountingObserver {
            responses: AtomicU32::new(0),
            tool_rounds: AtomicU32::new(0),
        };
        let mut messages = vec![ChatMessage::user("x")];
        run_agentic_loop(
            &provider,
            &serde_json::Value::Null,
            &mut messages,
            &[],
            &registry(),
            None,
            settings(),
            Some(&observer),
        )
        .await
        .unwrap();
        assert_eq!(observer.responses.load(Ordering::SeqCst), 3);
        assert_eq!(observer.tool_rounds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn usage_accumulates_across_turns() {
        let provider = ScriptedProvider::new(vec![
            Ok(tool_response("echo")),
            Ok(text_response("fin")),
        ]);
        let mut messages = vec![ChatMessage::user("x")];
        let outcome = run_agentic_loop(
            &provider,
            &serde_json::Value::Null,
            &mut messages,
            &[],
            &registry(),
            None,
            settings(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(outcome.total_usage.input_tokens, 900);
        assert_eq!(outcome.usage.input_tokens, 500);
    }
}
