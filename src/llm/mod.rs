//! 模型网关：抽象与实现
//!
//! - **traits**: ChatModel 抽象、消息与工具调用类型、ProviderError
//! - **openai**: OpenAI 兼容后端（chat-completions + function calling）
//! - **mock**: 脚本化测试后端

pub mod mock;
pub mod openai;
pub mod traits;

pub use mock::MockChatModel;
pub use openai::OpenAiChatModel;
pub use traits::{
    ChatMessage, ChatModel, ChatRole, ModelReply, ProviderError, ToolCallRequest, ToolSpec,
};
