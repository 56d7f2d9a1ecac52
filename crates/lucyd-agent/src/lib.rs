//! The agentic core: tool registry, the tool-call resolution loop, the
//! tiered context assembler, skills, and the built-in provider adapter.

pub mod agentic;
pub mod context;
pub mod error;
pub mod providers;
pub mod registry;
pub mod skills;

pub use agentic::{run_agentic_loop, LoopObserver, LoopOutcome, LoopSettings};
pub use context::{BuildParams, ContextAssembler};
pub use error::AgentError;
pub use registry::{ToolDef, ToolHandler, ToolRegistry};
pub use skills::SkillLoader;
