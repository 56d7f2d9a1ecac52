//! Core-owned memory tool surfaces.
//!
//! Registered only when the memory database is configured. Everything
//! else (filesystem, shell, web, TTS, scheduling) is an external tool
//! the host wires into the registry.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use lucyd_agent::{ToolDef, ToolHandler};
use lucyd_core::config::RecallConfig;
use lucyd_memory::recall::{self, EMPTY_RECALL_FALLBACK};
use lucyd_memory::{CommitmentStatus, MemoryStore};

/// Build the memory tool set over a configured store.
pub fn memory_tools(store: Arc<MemoryStore>, recall_cfg: RecallConfig) -> Vec<ToolDef> {
    vec![
        ToolDef {
            name: "memory_search".to_string(),
            description: "Search long-term memory. Searches indexed workspace files \
                          (memory/*.md, MEMORY.md) plus structured facts, episodes, \
                          and open commitments extracted from past sessions."
                .to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Search query (keywords or natural language)"},
                    "top_k": {"type": "integer", "description": "Max results to return (default: 10)", "default": 10},
                },
                "required": ["query"],
            }),
            handler: Arc::new(MemorySearch {
                store: Arc::clone(&store),
                recall_cfg,
            }),
        },
        ToolDef {
            name: "memory_get".to_string(),
            description: "Retrieve a file snippet from indexed memory by workspace-relative path. \
                          Use memory_search to find available file paths first."
                .to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "file_path": {"type": "string", "description": "Workspace-relative path (e.g., 'memory/2026-02-23.md', 'MEMORY.md')"},
                    "start_line": {"type": "integer", "description": "Start line (0-based)", "default": 0},
                    "end_line": {"type": "integer", "description": "End line", "default": 50},
                },
                "required": ["file_path"],
            }),
            handler: Arc::new(MemoryGet {
                store: Arc::clone(&store),
            }),
        },
        ToolDef {
            name: "memory_write".to_string(),
            description: "Store a fact in structured memory. Use for important information \
                          you want to recall reliably later. Facts are stored as \
                          entity-attribute-value triples."
                .to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "entity": {"type": "string", "description": "Who or what (lowercase, underscores for spaces)"},
                    "attribute": {"type": "string", "description": "What about them (lowercase, descriptive)"},
                    "value": {"type": "string", "description": "The fact"},
                },
                "required": ["entity", "attribute", "value"],
            }),
            handler: Arc::new(MemoryWrite {
                store: Arc::clone(&store),
            }),
        },
        ToolDef {
            name: "memory_forget".to_string(),
            description: "Mark a fact as no longer current. The fact is preserved in \
                          history but won't appear in future recalls."
                .to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "entity": {"type": "string"},
                    "attribute": {"type": "string"},
                },
                "required": ["entity", "attribute"],
            }),
            handler: Arc::new(MemoryForget {
                store: Arc::clone(&store),
            }),
        },
        ToolDef {
            name: "commitment_update".to_string(),
            description: "Update a commitment's status. Use the commitment ID shown in \
                          the [Open commitments] section (e.g. #7)."
                .to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "commitment_id": {"type": "integer", "description": "The commitment ID number"},
                    "status": {"type": "string", "enum": ["done", "expired", "cancelled"]},
                },
                "required": ["commitment_id", "status"],
            }),
            handler: Arc::new(CommitmentUpdate { store }),
        },
    ]
}

struct MemorySearch {
    store: Arc<MemoryStore>,
    recall_cfg: RecallConfig,
}

#[async_trait]
impl ToolHandler for MemorySearch {
    async fn call(&self, args: serde_json::Value) -> Result<String, String> {
        let query = args["query"].as_str().unwrap_or_default();
        if query.is_empty() {
            return Err("query is required".to_string());
        }
        let top_k = args["top_k"].as_u64().unwrap_or(10) as usize;

        let blocks = recall::recall(query, &self.store, &self.recall_cfg, top_k)
            .await
            .map_err(|e| format!("Error searching memory: {e}"))?;
        let result = recall::inject_recall(&blocks, self.recall_cfg.max_dynamic_tokens);
        if result.is_empty() {
            return Ok(EMPTY_RECALL_FALLBACK.to_string());
        }
        Ok(result)
    }
}

struct MemoryGet {
    store: Arc<MemoryStore>,
}

#[async_trait]
impl ToolHandler for MemoryGet {
    async fn call(&self, args: serde_json::Value) -> Result<String, String> {
        let path = args["file_path"].as_str().unwrap_or_default();
        if path.is_empty() {
            return Err("file_path is required".to_string());
        }
        let start = args["start_line"].as_u64().unwrap_or(0) as u32;
        let end = args["end_line"].as_u64().unwrap_or(50) as u32;
        self.store
            .get_file_snippet(path, start, end)
            .map_err(|e| format!("Error retrieving memory: {e}"))
    }
}

struct MemoryWrite {
    store: Arc<MemoryStore>,
}

#[async_trait]
impl ToolHandler for MemoryWrite {
    async fn call(&self, args: serde_json::Value) -> Result<String, String> {
        let entity = args["entity"].as_str().unwrap_or_default();
        let attribute = args["attribute"].as_str().unwrap_or_default();
        let value = args["value"].as_str().unwrap_or_default();
        if entity.is_empty() || attribute.is_empty() || value.is_empty() {
            return Err("entity, attribute, and value are required".to_string());
        }

        let entity = self
            .store
            .resolve_entity(entity)
            .map_err(|e| e.to_string())?;
        let attribute = lucyd_memory::normalize_entity(attribute);

        use lucyd_memory::store::FactWrite;
        match self
            .store
            .upsert_fact(&entity, &attribute, value, 1.0, "agent")
            .map_err(|e| e.to_string())?
        {
            FactWrite::Unchanged => Ok(format!("Already known: {entity}.{attribute} = {value}")),
            FactWrite::Updated => Ok(format!("Updated: {entity}.{attribute} = {value}")),
            FactWrite::Inserted => Ok(format!("Stored: {entity}.{attribute} = {value}")),
        }
    }
}

struct MemoryForget {
    store: Arc<MemoryStore>,
}

#[async_trait]
impl ToolHandler for MemoryForget {
    async fn call(&self, args: serde_json::Value) -> Result<String, String> {
        let entity = args["entity"].as_str().unwrap_or_default();
        let attribute = args["attribute"].as_str().unwrap_or_default();
        if entity.is_empty() || attribute.is_empty() {
            return Err("entity and attribute are required".to_string());
        }
        let entity = self
            .store
            .resolve_entity(entity)
            .map_err(|e| e.to_string())?;

        let forgotten = self
            .store
            .invalidate_fact(&entity, attribute)
            .map_err(|e| e.to_string())?;
        if forgotten {
            Ok(format!("Forgotten: {entity}.{attribute}"))
        } else {
            Ok(format!("No current fact found for {entity}.{attribute}"))
        }
    }
}

struct CommitmentUpdate {
    store: Arc<MemoryStore>,
}

#[async_trait]
impl ToolHandler for CommitmentUpdate {
    async fn call(&self, args: serde_json::Value) -> Result<String, String> {
        let id = args["commitment_id"]
            .as_i64()
            .ok_or_else(|| "commitment_id is required".to_string())?;
        let status_str = args["status"].as_str().unwrap_or_default();
        let status: CommitmentStatus = status_str
            .parse()
            .map_err(|e: String| e)?;
        if status == CommitmentStatus::Open {
            return Err("commitments can only move out of 'open'".to_string());
        }

        match self.store.update_commitment_status(id, status) {
            Ok(()) => Ok(format!("Commitment #{id} marked as {status}")),
            Err(lucyd_memory::MemoryError::CommitmentNotOpen(_)) => {
                Ok(format!("No open commitment found with ID #{id}"))
            }
            Err(e) => {
                warn!(error = %e, "commitment update failed");
                Err(format!("Error updating commitment: {e}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lucyd_agent::ToolRegistry;

    fn registry_with_memory() -> (ToolRegistry, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::open_in_memory().unwrap());
        let mut registry = ToolRegistry::new(10_000);
        registry.register_many(memory_tools(Arc::clone(&store), RecallConfig::default()));
        (registry, store)
    }

    #[tokio::test]
    async fn write_then_forget_roundtrip() {
        let (registry, store) = registry_with_memory();

        let (out, is_error) = registry
            .execute(
                "memory_write",
                serde_json::json!({"entity": "Anna", "attribute": "Lives In", "value": "graz"}),
            )
            .await;
        assert!(!is_error);
        assert_eq!(out, "Stored: anna.lives_in = graz");
        assert_eq!(store.lookup_facts(&["anna".to_string()], 5).unwrap().len(), 1);

        let (out, _) = registry
            .execute(
                "memory_write",
                serde_json::json!({"entity": "anna", "attribute": "lives_in", "value": "graz"}),
            )
            .await;
        assert!(out.starts_with("Already known:"));

        let (out, _) = registry
            .execute(
                "memory_forget",
                serde_json::json!({"entity": "anna", "attribute": "lives_in"}),
            )
            .await;
        assert_eq!(out, "Forgotten: anna.lives_in");
        assert!(store.lookup_facts(&["anna".to_string()], 5).unwrap().is_empty());
    }

    #[tokio::test]
    async fn commitment_update_only_touches_open_rows() {
        let (registry, store) = registry_with_memory();
        let ep = store
            .insert_episode("s1", &["x".into()], &[], "[]", "Sum.", "warm")
            .unwrap();
        let id = store.insert_commitment(ep, "user", "call mom", None).unwrap();

        let (out, is_error) = registry
            .execute(
                "commitment_update",
                serde_json::json!({"commitment_id": id, "status": "done"}),
            )
            .await;
        assert!(!is_error);
        assert!(out.contains("marked as done"));

        let (out, _) = registry
            .execute(
                "commitment_update",
                serde_json::json!({"commitment_id": id, "status": "cancelled"}),
            )
            .await;
        assert!(out.contains("No open commitment"));
    }

    #[tokio::test]
    async fn memory_search_reports_empty_memory() {
        let (registry, _store) = registry_with_memory();
        let (out, is_error) = registry
            .execute("memory_search", serde_json::json!({"query": "anything at all"}))
            .await;
        assert!(!is_error);
        assert_eq!(out, EMPTY_RECALL_FALLBACK);
    }

    #[tokio::test]
    async fn memory_search_finds_facts() {
        let (registry, store) = registry_with_memory();
        store
            .upsert_fact("nicolas", "role", "founder", 1.0, "s1")
            .unwrap();
        let (out, _) = registry
            .execute("memory_search", serde_json::json!({"query": "what about nicolas"}))
            .await;
        assert!(out.contains("[Known facts]"));
        assert!(out.contains("founder"));
    }
}
