#![allow(clippy::missing_docs_in_private_items)]

pub mod executors;
pub mod orchestrator;
pub mod prompts;
pub mod registry;

pub use orchestrator::{AgentOrchestrator, HandoffPackage, TriggerRequest};
pub use prompts::PromptManager;
pub use registry::{ToolContext, ToolError, ToolExecutor, ToolRegistry};
