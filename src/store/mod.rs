//! 持久化层
//!
//! - **models**: 对话 / 消息 / 审计行类型
//! - **conversations**: 对话与消息存储（上下文重建的唯一来源）
//! - **audit**: 工具调用审计日志

pub mod audit;
pub mod conversations;
pub mod models;

pub use audit::AuditLog;
pub use conversations::ConversationStore;
pub use models::{AuditStatus, Conversation, StoredMessage, StoredRole, ToolCallLog};

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

/// 打开（必要时创建）SQLite 数据库并返回连接池；各存储共享同一个 Pool
pub async fn connect_sqlite(
    db_path: impl AsRef<std::path::Path>,
) -> Result<SqlitePool, sqlx::Error> {
    let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
    SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await
}
