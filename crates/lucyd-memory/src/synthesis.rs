//! Recall synthesis — optional LLM rewrite of assembled recall blocks.
//!
//! Transforms the raw section output into a short narrative or factual
//! paragraph before injection. Defaults to passthrough ("structured");
//! any failure falls back to the raw recall, so synthesis can never make
//! a turn worse than no synthesis.

use tracing::{debug, warn};

use lucyd_core::provider::Provider;
use lucyd_core::types::{ChatMessage, Usage};

const NARRATIVE_PROMPT: &str = "TASK: Rewrite the memory blocks below into a short narrative paragraph.\n\n\
OUTPUT RULES (follow exactly):\n\
1. Write 2-4 sentences of prose. No more.\n\
2. Use temporal framing: 'over the past week', 'since Monday', 'in the last few days'.\n\
3. Show trajectory: 'went from X to Y', 'started with X, now at Y'.\n\
4. DO NOT list, enumerate, or use bullet points. No dashes, no numbering.\n\
5. DO NOT invent facts. Only use information from the blocks below.\n\
6. If there are open commitments with deadlines, copy them exactly at the end \
on a line starting with 'Open commitments:'.\n\
7. Return ONLY the paragraph (and commitments line if any). \
No preamble, no explanation, no labels, no 'Here is...'.\n\n\
MEMORY BLOCKS:\n{recall_text}\n\n\
OUTPUT:";

const FACTUAL_PROMPT: &str = "TASK: Rewrite the memory blocks below into a short factual summary.\n\n\
OUTPUT RULES (follow exactly):\n\
1. Write 3-5 sentences of prose. No more.\n\
2. Lead with the most recent or important facts.\n\
3. Group related facts in the same sentence where natural.\n\
4. DO NOT list, enumerate, or use bullet points. No dashes, no numbering.\n\
5. DO NOT invent facts. Only use information from the blocks below.\n\
6. Neutral tone. No emotional framing, no editorializing.\n\
7. If there are open commitments with deadlines, copy them exactly at the end \
on a line starting with 'Open commitments:'.\n\
8. Return ONLY the summary (and commitments line if any). \
No preamble, no explanation, no labels, no 'Here is...'.\n\n\
MEMORY BLOCKS:\n{recall_text}\n\n\
OUTPUT:";

/// Synthesis output with usage for cost tracking (when the LLM was called).
pub struct SynthesisResult {
    pub text: String,
    pub usage: Option<Usage>,
}

fn prompt_for_style(style: &str) -> Option<&'static str> {
    match style {
        "narrative" => Some(NARRATIVE_PROMPT),
        "factual" => Some(FACTUAL_PROMPT),
        _ => None,
    }
}

/// Rewrite raw recall text in the configured style.
///
/// The token-use footer emitted by `inject_recall` survives the rewrite:
/// footer lines are re-appended to the synthesized paragraph.
pub async fn synthesize_recall(
    recall_text: &str,
    style: &str,
    provider: &dyn Provider,
) -> SynthesisResult {
    if style == "structured" || recall_text.trim().is_empty() {
        return SynthesisResult {
            text: recall_text.to_string(),
            usage: None,
        };
    }

    let Some(template) = prompt_for_style(style) else {
        warn!(style, "unknown synthesis style, falling back to structured");
        return SynthesisResult {
            text: recall_text.to_string(),
            usage: None,
        };
    };

    let prompt = template.replace("{recall_text}", recall_text);
    let system = provider.format_system(&[]);
    let messages = provider.format_messages(&[ChatMessage::user(prompt)]);

    match provider.complete(&system, &messages, &[]).await {
        Ok(response) => {
            let synthesized = response.text.trim().to_string();
            if synthesized.is_empty() {
                warn!("synthesis returned empty, falling back to raw recall");
                return SynthesisResult {
                    text: recall_text.to_string(),
                    usage: Some(response.usage),
                };
            }

            let footer_lines: Vec<&str> = recall_text
                .lines()
                .filter(|l| l.starts_with("[Memory loaded:") || l.starts_with("[Dropped"))
                .collect();

            let text = if footer_lines.is_empty() {
                synthesized
            } else {
                format!("{}\n{}", synthesized, footer_lines.join("\n"))
            };

            debug!(
                style,
                from_chars = recall_text.len(),
                to_chars = text.len(),
                "recall synthesized"
            );
            SynthesisResult {
                text,
                usage: Some(response.usage),
            }
        }
        Err(e) => {
            warn!(error = %e, style, "synthesis failed, falling back to raw recall");
            SynthesisResult {
                text: recall_text.to_string(),
                usage: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use lucyd_core::provider::{CompletionResponse, ProviderError};
    use lucyd_core::types::SystemBlock;

    struct FixedProvider {
        reply: String,
        fail: bool,
    }

    #[async_trait]
    impl Provider for FixedProvider {
        fn name(&self) -> &str {
            "fixed"
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
            if self.fail {
                return Err(ProviderError::Unavailable("down".to_string()));
            }
            Ok(CompletionResponse {
                text: self.reply.clone(),
                stop_reason: "end_turn".to_string(),
                tool_calls: Vec::new(),
                usage: Usage {
                    input_tokens: 50,
                    output_tokens: 20,
                    ..Default::default()
                },
            })
        }
    }

    const RAW: &str = "[Known facts]\n  user — mood: stressed\n\n\
[Memory loaded: Known facts | 10/1000 tokens used]";

    #[tokio::test]
    async fn structured_style_is_passthrough() {
        let p = FixedProvider {
            reply: "unused".to_string(),
            fail: false,
        };
        let result = synthesize_recall(RAW, "structured", &p).await;
        assert_eq!(result.text, RAW);
        assert!(result.usage.is_none());
    }

    #[tokio::test]
    async fn narrative_preserves_footer() {
        let p = FixedProvider {
            reply: "The user has been stressed lately.".to_string(),
            fail: false,
        };
        let result = synthesize_recall(RAW, "narrative", &p).await;
        assert!(result.text.starts_with("The user has been stressed lately."));
        assert!(result.text.contains("[Memory loaded: Known facts | 10/1000 tokens used]"));
        assert!(result.usage.is_some());
    }

    #[tokio::test]
    async fn provider_failure_falls_back_to_raw() {
        let p = FixedProvider {
            reply: String::new(),
            fail: true,
        };
        let result = synthesize_recall(RAW, "factual", &p).await;
        assert_eq!(result.text, RAW);
    }

    #[tokio::test]
    async fn empty_synthesis_falls_back_to_raw() {
        let p = FixedProvider {
            reply: "   ".to_string(),
            fail: false,
        };
        let result = synthesize_recall(RAW, "narrative", &p).await;
        assert_eq!(result.text, RAW);
    }

    #[tokio::test]
    async fn unknown_style_is_passthrough() {
        let p = FixedProvider {
            reply: "x".to_string(),
            fail: false,
        };
        let result = synthesize_recall(RAW, "poetic", &p).await;
        assert_eq!(result.text, RAW);
    }
}
