//! SQLite 任务存储
//!
//! TaskStore 的参考实现：与对话存储共用连接池风格，启动时建表，按 user_id 严格隔离。

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use crate::store::models::parse_rfc3339;
use crate::tasks::{StatusFilter, Task, TaskError, TaskStatus, TaskStore, TaskUpdate};

/// SQLite 任务存储；一个 Pool 可与其他存储共享
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// 使用既有连接池创建并初始化表结构
    pub async fn new(pool: SqlitePool) -> Result<Self, TaskError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_user ON tasks(user_id)")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// 按 id 取任务并校验归属：不存在 NotFound，他人的 Forbidden
    async fn fetch_owned(&self, user_id: &str, task_id: &str) -> Result<Task, TaskError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;

        let row = row.ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;
        let task = row_to_task(&row)?;
        if task.user_id != user_id {
            return Err(TaskError::Forbidden);
        }
        Ok(task)
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create_task(
        &self,
        user_id: &str,
        title: &str,
        description: Option<&str>,
    ) -> Result<Task, TaskError> {
        let now = Utc::now();
        let task = Task {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: title.to_string(),
            description: description.map(String::from),
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            "INSERT INTO tasks (id, user_id, title, description, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&task.id)
        .bind(&task.user_id)
        .bind(&task.title)
        .bind(&task.description)
        .bind(task.status.as_str())
        .bind(task.created_at.to_rfc3339())
        .bind(task.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(task)
    }

    async fn list_tasks(&self, user_id: &str, filter: StatusFilter) -> Result<Vec<Task>, TaskError> {
        let rows = match filter {
            StatusFilter::All => {
                sqlx::query("SELECT * FROM tasks WHERE user_id = ? ORDER BY created_at ASC")
                    .bind(user_id)
                    .fetch_all(&self.pool)
                    .await?
            }
            StatusFilter::Pending | StatusFilter::Completed => {
                let status = if filter == StatusFilter::Pending {
                    "pending"
                } else {
                    "completed"
                };
                sqlx::query(
                    "SELECT * FROM tasks WHERE user_id = ? AND status = ? ORDER BY created_at ASC",
                )
                .bind(user_id)
                .bind(status)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(row_to_task).collect()
    }

    async fn update_task(
        &self,
        user_id: &str,
        task_id: &str,
        update: TaskUpdate,
    ) -> Result<Task, TaskError> {
        let mut task = self.fetch_owned(user_id, task_id).await?;

        if let Some(title) = update.title {
            task.title = title;
        }
        if let Some(description) = update.description {
            task.description = Some(description);
        }
        task.updated_at = Utc::now();

        sqlx::query("UPDATE tasks SET title = ?, description = ?, updated_at = ? WHERE id = ?")
            .bind(&task.title)
            .bind(&task.description)
            .bind(task.updated_at.to_rfc3339())
            .bind(&task.id)
            .execute(&self.pool)
            .await?;

        Ok(task)
    }

    async fn complete_task(&self, user_id: &str, task_id: &str) -> Result<Task, TaskError> {
        let mut task = self.fetch_owned(user_id, task_id).await?;
        if task.status == TaskStatus::Completed {
            return Err(TaskError::AlreadyCompleted(task_id.to_string()));
        }

        task.status = TaskStatus::Completed;
        task.updated_at = Utc::now();

        sqlx::query("UPDATE tasks SET status = 'completed', updated_at = ? WHERE id = ?")
            .bind(task.updated_at.to_rfc3339())
            .bind(&task.id)
            .execute(&self.pool)
            .await?;

        Ok(task)
    }

    async fn delete_task(&self, user_id: &str, task_id: &str) -> Result<(), TaskError> {
        let task = self.fetch_owned(user_id, task_id).await?;

        sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(&task.id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> Result<Task, TaskError> {
    let status: String = row.get("status");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");
    Ok(Task {
        id: row.get("id"),
        user_id: row.get("user_id"),
        title: row.get("title"),
        description: row.get("description"),
        status: if status == "completed" {
            TaskStatus::Completed
        } else {
            TaskStatus::Pending
        },
        created_at: parse_rfc3339(&created_at)?,
        updated_at: parse_rfc3339(&updated_at)?,
    })
}
