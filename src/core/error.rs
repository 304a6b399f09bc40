//! Agent 错误类型
//!
//! 编排器向调用方传播的错误分类：请求校验失败、对话不存在、越权访问、存储故障、取消。
//! 工具参数错误 / 工具执行失败 / 未知工具均在回合内恢复（见 dispatcher），不出现在此处。

use thiserror::Error;

/// 编排过程中向外传播的错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// 请求形状校验失败（空消息、超长等），发生在任何持久化之前
    #[error("Validation failed: {0}")]
    Validation(String),

    /// 指定的对话在该用户名下不存在
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    /// 对话属于其他用户；对外表现与「不存在」一致，避免泄露他人数据的存在性
    #[error("Authorization failed")]
    Authorization,

    /// 存储层故障（SQLite）
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    /// 审计/摘要序列化失败
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 调用方在回合间取消；已派发的工具调用仍会完成并落审计，
    /// 已接收的用户消息会随之持久化
    #[error("Cancelled")]
    Cancelled,
}

impl AgentError {
    /// 面向最终用户的文案。越权与不存在统一为「找不到对话」。
    pub fn user_message(&self) -> String {
        match self {
            AgentError::Validation(msg) => format!("Invalid request: {msg}"),
            AgentError::ConversationNotFound(_) | AgentError::Authorization => {
                "Conversation not found.".to_string()
            }
            AgentError::Store(_) | AgentError::Serialization(_) => {
                "Internal storage error, please try again later.".to_string()
            }
            AgentError::Cancelled => "Request cancelled.".to_string(),
        }
    }
}
