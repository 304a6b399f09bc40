//! 对话存储
//!
//! 对话与消息的 SQLite 持久化：懒创建、归属校验、按时间与序号全序加载、
//! 回合事务化写入并递增 revision。进程不在内存中缓存任何对话状态，
//! 重启后一切连续性都来自这里。

use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use crate::core::AgentError;
use crate::store::models::{parse_rfc3339, Conversation, StoredMessage, StoredRole};

/// 标题从首条用户消息截取的最大字符数
const TITLE_MAX_CHARS: usize = 60;

/// 对话存储；持有连接池，可与审计、任务存储共享同一 Pool
pub struct ConversationStore {
    pool: SqlitePool,
}

impl ConversationStore {
    /// 使用既有连接池创建并初始化表结构
    pub async fn new(pool: SqlitePool) -> Result<Self, AgentError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                revision INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(&pool)
        .await?;

        // seq 自增列作为同一时间戳下的全序决胜
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                conversation_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                tool_call_results TEXT,
                FOREIGN KEY (conversation_id) REFERENCES conversations(id)
            )",
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_conversations_user ON conversations(user_id)")
            .execute(&pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id)",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// 新建对话（首条消息到达且未携带对话 id 时调用）
    pub async fn create(
        &self,
        user_id: &str,
        first_message: &str,
    ) -> Result<Conversation, AgentError> {
        let now = chrono::Utc::now();
        let conversation = Conversation {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: Some(derive_title(first_message)),
            created_at: now,
            updated_at: now,
            revision: 0,
        };

        sqlx::query(
            "INSERT INTO conversations (id, user_id, title, created_at, updated_at, revision)
             VALUES (?, ?, ?, ?, ?, 0)",
        )
        .bind(&conversation.id)
        .bind(&conversation.user_id)
        .bind(&conversation.title)
        .bind(conversation.created_at.to_rfc3339())
        .bind(conversation.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(conversation)
    }

    /// 按 id 取对话并校验归属。不存在返回 ConversationNotFound；
    /// 属于他人返回 Authorization 而不是空结果，避免掩盖隔离 bug。
    pub async fn get(&self, user_id: &str, conversation_id: &str) -> Result<Conversation, AgentError> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = ?")
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await?;

        let row = row.ok_or_else(|| AgentError::ConversationNotFound(conversation_id.to_string()))?;
        let conversation = row_to_conversation(&row)?;
        if conversation.user_id != user_id {
            return Err(AgentError::Authorization);
        }
        Ok(conversation)
    }

    /// 上下文重建：加载该用户该对话的全部消息，按 (timestamp, seq) 升序。
    /// 纯读取，无副作用；两次调用之间无写入时结果逐字节一致。
    pub async fn load_messages(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<Vec<StoredMessage>, AgentError> {
        // 先做归属校验，跨用户请求在这里就会失败
        self.get(user_id, conversation_id).await?;

        let rows = sqlx::query(
            "SELECT * FROM messages WHERE conversation_id = ? ORDER BY timestamp ASC, seq ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_message).collect()
    }

    /// 持久化一个回合：用户消息 + 可选的 assistant 消息，同一事务内落盘，
    /// 并 bump 对话的 updated_at 与 revision。Provider 失败的回合只传用户消息。
    pub async fn persist_turn(
        &self,
        conversation: &Conversation,
        user_message: &StoredMessage,
        assistant_message: Option<&StoredMessage>,
    ) -> Result<(), AgentError> {
        let mut tx = self.pool.begin().await?;

        insert_message(&mut tx, user_message).await?;
        if let Some(assistant) = assistant_message {
            insert_message(&mut tx, assistant).await?;
        }

        let now = chrono::Utc::now().to_rfc3339();
        let updated = sqlx::query(
            "UPDATE conversations SET updated_at = ?, revision = revision + 1
             WHERE id = ? AND revision = ?",
        )
        .bind(&now)
        .bind(&conversation.id)
        .bind(conversation.revision)
        .execute(&mut *tx)
        .await?;

        // revision 不匹配说明另一请求在本回合期间插队写入；
        // 对话锁已在进程内阻止这种情况，这里是最后一道防线
        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(AgentError::Store(sqlx::Error::RowNotFound));
        }

        tx.commit().await?;
        Ok(())
    }

    /// 该用户的全部对话，最近更新在前（REPL /history 用）
    pub async fn list(&self, user_id: &str) -> Result<Vec<Conversation>, AgentError> {
        let rows = sqlx::query(
            "SELECT * FROM conversations WHERE user_id = ? ORDER BY updated_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_conversation).collect()
    }
}

async fn insert_message(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    message: &StoredMessage,
) -> Result<(), AgentError> {
    let results_json = message
        .tool_call_results
        .as_ref()
        .map(|v| v.to_string());

    sqlx::query(
        "INSERT INTO messages (id, conversation_id, user_id, role, content, timestamp, tool_call_results)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&message.id)
    .bind(&message.conversation_id)
    .bind(&message.user_id)
    .bind(message.role.as_str())
    .bind(&message.content)
    .bind(message.timestamp.to_rfc3339())
    .bind(results_json)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

fn derive_title(first_message: &str) -> String {
    let trimmed = first_message.trim();
    if trimmed.chars().count() <= TITLE_MAX_CHARS {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(TITLE_MAX_CHARS).collect();
        format!("{cut}…")
    }
}

fn row_to_conversation(row: &sqlx::sqlite::SqliteRow) -> Result<Conversation, AgentError> {
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");
    Ok(Conversation {
        id: row.get("id"),
        user_id: row.get("user_id"),
        title: row.get("title"),
        created_at: parse_rfc3339(&created_at)?,
        updated_at: parse_rfc3339(&updated_at)?,
        revision: row.get("revision"),
    })
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<StoredMessage, AgentError> {
    let role: String = row.get("role");
    let timestamp: String = row.get("timestamp");
    let results: Option<String> = row.get("tool_call_results");
    Ok(StoredMessage {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        user_id: row.get("user_id"),
        role: if role == "assistant" {
            StoredRole::Assistant
        } else {
            StoredRole::User
        },
        content: row.get("content"),
        timestamp: parse_rfc3339(&timestamp)?,
        tool_call_results: results.and_then(|s| serde_json::from_str(&s).ok()),
    })
}
