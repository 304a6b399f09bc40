//! 核心：错误分类、对话锁与回合编排

pub mod error;
pub mod locks;
pub mod orchestrator;

pub use error::AgentError;
pub use locks::ConversationLocks;
pub use orchestrator::{
    AgentSettings, ChatRequest, ChatResponse, Orchestrator, TaskOperation, ToolCallSummary,
    ToolUsage, DEFAULT_SYSTEM_PROMPT, PROVIDER_FALLBACK_REPLY, TURN_LIMIT_NOTE,
};
