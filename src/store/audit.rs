//! 工具调用审计
//!
//! 每次派发前写入 pending 行，结束后回填结果与状态；行只增不删，重试产生新行。
//! 除持久化外同时输出结构化 tool_audit 日志，便于线上排查。

use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use crate::core::AgentError;
use crate::store::models::{parse_rfc3339, AuditStatus, ToolCallLog};
use crate::tools::ToolResult;

/// 审计日志存储
pub struct AuditLog {
    pool: SqlitePool,
}

impl AuditLog {
    /// 使用既有连接池创建并初始化表结构
    pub async fn new(pool: SqlitePool) -> Result<Self, AgentError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tool_call_logs (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                user_id TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                message_id TEXT NOT NULL,
                tool_name TEXT NOT NULL,
                parameters TEXT NOT NULL,
                result TEXT,
                status TEXT NOT NULL,
                timestamp TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tool_call_logs_message ON tool_call_logs(message_id)",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// 派发前登记：写入 pending 行，返回审计行 id
    pub async fn begin(
        &self,
        user_id: &str,
        conversation_id: &str,
        message_id: &str,
        tool_name: &str,
        parameters: &Value,
    ) -> Result<String, AgentError> {
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO tool_call_logs
                (id, user_id, conversation_id, message_id, tool_name, parameters, result, status, timestamp)
             VALUES (?, ?, ?, ?, ?, ?, NULL, 'pending', ?)",
        )
        .bind(&id)
        .bind(user_id)
        .bind(conversation_id)
        .bind(message_id)
        .bind(tool_name)
        .bind(parameters.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    /// 派发后回填结果；任何已登记的调用都必须走到这里，不允许悬挂 pending
    pub async fn finalize(&self, log_id: &str, result: &ToolResult) -> Result<(), AgentError> {
        let status = if result.is_success() {
            AuditStatus::Success
        } else {
            AuditStatus::Error
        };
        let result_json = serde_json::to_value(result)?;

        sqlx::query("UPDATE tool_call_logs SET result = ?, status = ? WHERE id = ?")
            .bind(result_json.to_string())
            .bind(status.as_str())
            .bind(log_id)
            .execute(&self.pool)
            .await?;

        let audit = serde_json::json!({
            "event": "tool_audit",
            "log_id": log_id,
            "status": status.as_str(),
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        Ok(())
    }

    /// 某条触发消息名下的全部审计行，按写入顺序
    pub async fn for_message(&self, message_id: &str) -> Result<Vec<ToolCallLog>, AgentError> {
        let rows = sqlx::query(
            "SELECT * FROM tool_call_logs WHERE message_id = ? ORDER BY seq ASC",
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_log).collect()
    }

    /// 整段对话的审计行（取证用）
    pub async fn for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ToolCallLog>, AgentError> {
        let rows = sqlx::query(
            "SELECT * FROM tool_call_logs WHERE conversation_id = ? ORDER BY seq ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_log).collect()
    }
}

fn row_to_log(row: &sqlx::sqlite::SqliteRow) -> Result<ToolCallLog, AgentError> {
    let parameters: String = row.get("parameters");
    let result: Option<String> = row.get("result");
    let status: String = row.get("status");
    let timestamp: String = row.get("timestamp");
    Ok(ToolCallLog {
        id: row.get("id"),
        user_id: row.get("user_id"),
        conversation_id: row.get("conversation_id"),
        message_id: row.get("message_id"),
        tool_name: row.get("tool_name"),
        parameters: serde_json::from_str(&parameters).unwrap_or(Value::Null),
        result: result.and_then(|s| serde_json::from_str(&s).ok()),
        status: match status.as_str() {
            "success" => AuditStatus::Success,
            "error" => AuditStatus::Error,
            _ => AuditStatus::Pending,
        },
        timestamp: parse_rfc3339(&timestamp)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::connect_sqlite;
    use crate::tools::{ToolErrorKind, ToolResult};
    use tempfile::TempDir;

    async fn audit() -> (TempDir, AuditLog) {
        let dir = TempDir::new().unwrap();
        let pool = connect_sqlite(dir.path().join("audit.db")).await.unwrap();
        let audit = AuditLog::new(pool).await.unwrap();
        (dir, audit)
    }

    #[tokio::test]
    async fn test_begin_then_finalize() {
        let (_dir, audit) = audit().await;
        let params = serde_json::json!({"title": "Buy milk"});

        let log_id = audit
            .begin("u1", "c1", "m1", "add_task", &params)
            .await
            .unwrap();

        let pending = audit.for_message("m1").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, AuditStatus::Pending);
        assert!(pending[0].result.is_none());

        let result = ToolResult::success(serde_json::json!({"id": "t1"}));
        audit.finalize(&log_id, &result).await.unwrap();

        let done = audit.for_message("m1").await.unwrap();
        assert_eq!(done[0].status, AuditStatus::Success);
        assert!(done[0].result.is_some());
        assert_eq!(done[0].tool_name, "add_task");
    }

    #[tokio::test]
    async fn test_failed_call_finalized_as_error() {
        let (_dir, audit) = audit().await;
        let params = serde_json::json!({"task_id": "nope"});

        let log_id = audit
            .begin("u1", "c1", "m1", "complete_task", &params)
            .await
            .unwrap();
        let result = ToolResult::failure(ToolErrorKind::NotFound, "task not found");
        audit.finalize(&log_id, &result).await.unwrap();

        let logs = audit.for_message("m1").await.unwrap();
        assert_eq!(logs[0].status, AuditStatus::Error);
    }

    #[tokio::test]
    async fn test_retries_append_new_rows() {
        let (_dir, audit) = audit().await;
        let params = serde_json::json!({"status": "all"});

        // 同一回合内模型重试同一工具：两行，而不是覆盖
        let a = audit.begin("u1", "c1", "m1", "list_tasks", &params).await.unwrap();
        let b = audit.begin("u1", "c1", "m1", "list_tasks", &params).await.unwrap();
        assert_ne!(a, b);

        let logs = audit.for_message("m1").await.unwrap();
        assert_eq!(logs.len(), 2);
    }
}
