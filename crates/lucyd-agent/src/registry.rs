use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

/// One tool implementation. Errors come back as plain text — the agentic
/// loop does not distinguish tool errors from tool successes; the result
/// text is the LLM's to interpret.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: serde_json::Value) -> Result<String, String>;
}

/// A registered tool: schema for the provider, handler for execution.
#[derive(Clone)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    pub handler: Arc<dyn ToolHandler>,
}

/// Holds all registered tools and executes them on behalf of the
/// agentic loop. Registration order is preserved — it is the order the
/// schemas are presented to the provider.
pub struct ToolRegistry {
    tools: Vec<ToolDef>,
    truncation_limit: usize,
}

impl ToolRegistry {
    pub fn new(truncation_limit: usize) -> Self {
        Self {
            tools: Vec::new(),
            truncation_limit,
        }
    }

    /// Register tools; a re-registered name replaces the old handler.
    pub fn register_many(&mut self, defs: Vec<ToolDef>) {
        for def in defs {
            if let Some(existing) = self.tools.iter_mut().find(|t| t.name == def.name) {
                warn!(tool = %def.name, "tool re-registered, replacing");
                *existing = def;
            } else {
                self.tools.push(def);
            }
        }
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name == name)
    }

    /// (name, first line of description) pairs for the system prompt.
    pub fn get_brief_descriptions(&self) -> Vec<(String, String)> {
        self.tools
            .iter()
            .map(|t| {
                let brief = t.description.lines().next().unwrap_or("").to_string();
                (t.name.clone(), brief)
            })
            .collect()
    }

    /// Full tool schemas in provider wire shape.
    pub fn get_schemas(&self) -> Vec<serde_json::Value> {
        self.tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })
            })
            .collect()
    }

    /// Execute a tool by name. Returns (result_text, is_error); output is
    /// truncated to the configured limit.
    pub async fn execute(&self, name: &str, args: serde_json::Value) -> (String, bool) {
        let Some(tool) = self.tools.iter().find(|t| t.name == name) else {
            info!(tool = name, "unknown tool requested");
            return (format!("unknown tool: {name}"), true);
        };

        debug!(tool = name, "executing tool");
        let (text, is_error) = match tool.handler.call(args).await {
            Ok(text) => (text, false),
            Err(text) => (text, true),
        };
        (self.truncate(&text), is_error)
    }

    fn truncate(&self, text: &str) -> String {
        if self.truncation_limit == 0 || text.chars().count() <= self.truncation_limit {
            return text.to_string();
        }
        let cut: String = text.chars().take(self.truncation_limit).collect();
        format!("{cut}\n[… output truncated at {} chars]", self.truncation_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl ToolHandler for Echo {
        async fn call(&self, args: serde_json::Value) -> Result<String, String> {
            Ok(args["text"].as_str().unwrap_or("").to_string())
        }
    }

    struct Failing;

    #[async_trait]
    impl ToolHandler for Failing {
        async fn call(&self, _args: serde_json::Value) -> Result<String, String> {
            Err("disk on fire".to_string())
        }
    }

    fn echo_def() -> ToolDef {
        ToolDef {
            name: "echo".to_string(),
            description: "Echo text back.\nLonger help here.".to_string(),
            input_schema: serde_json::json!({"type": "object"}),
            handler: Arc::new(Echo),
        }
    }

    #[tokio::test]
    async fn execute_returns_handler_output() {
        let mut reg = ToolRegistry::new(1000);
        reg.register_many(vec![echo_def()]);
        let (out, is_error) = reg.execute("echo", serde_json::json!({"text": "hi"})).await;
        assert_eq!(out, "hi");
        assert!(!is_error);
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_result() {
        let reg = ToolRegistry::new(1000);
        let (out, is_error) = reg.execute("nope", serde_json::json!({})).await;
        assert!(out.contains("unknown tool"));
        assert!(is_error);
    }

    #[tokio::test]
    async fn handler_error_becomes_result_text() {
        let mut reg = ToolRegistry::new(1000);
        reg.register_many(vec![ToolDef {
            name: "fail".to_string(),
            description: "Always fails.".to_string(),
            input_schema: serde_json::json!({"type": "object"}),
            handler: Arc::new(Failing),
        }]);
        let (out, is_error) = reg.execute("fail", serde_json::json!({})).await;
        assert_eq!(out, "disk on fire");
        assert!(is_error);
    }

    #[tokio::test]
    async fn output_is_truncated_at_limit() {
        let mut reg = ToolRegistry::new(10);
        reg.register_many(vec![echo_def()]);
        let long = "x".repeat(50);
        let (out, _) = reg.execute("echo", serde_json::json!({"text": long})).await;
        assert!(out.starts_with("xxxxxxxxxx"));
        assert!(out.contains("truncated at 10 chars"));
    }

    #[test]
    fn brief_descriptions_take_first_line() {
        let mut reg = ToolRegistry::new(1000);
        reg.register_many(vec![echo_def()]);
        let briefs = reg.get_brief_descriptions();
        assert_eq!(briefs[0], ("echo".to_string(), "Echo text back.".to_string()));
    }
}
