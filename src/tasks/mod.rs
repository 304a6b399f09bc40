//! 任务存储契约
//!
//! Dispatcher 调用的外部协作方接口：按用户隔离的任务 CRUD，越权与不存在均为类型化错误，
//! 绝不返回含糊的成功/失败。user_id 一律来自认证上下文注入，不接受模型输出。

pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use sqlite::SqliteTaskStore;

/// 单个待办任务
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 任务状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Completed => "completed",
        }
    }
}

/// list_tasks 的状态过滤；默认 all
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum StatusFilter {
    #[default]
    All,
    Pending,
    Completed,
}

/// update_task 的可选字段；None 表示不修改
#[derive(Clone, Debug, Default)]
pub struct TaskUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
}

/// 任务存储的类型化错误
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Task not found: {0}")]
    NotFound(String),

    /// 任务属于其他用户
    #[error("Forbidden")]
    Forbidden,

    /// 对已完成任务重复 complete
    #[error("Task already completed: {0}")]
    AlreadyCompleted(String),

    #[error("Task storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

/// 任务存储接口；每个方法对底层最多产生一次读/写
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create_task(
        &self,
        user_id: &str,
        title: &str,
        description: Option<&str>,
    ) -> Result<Task, TaskError>;

    async fn list_tasks(&self, user_id: &str, filter: StatusFilter) -> Result<Vec<Task>, TaskError>;

    async fn update_task(
        &self,
        user_id: &str,
        task_id: &str,
        update: TaskUpdate,
    ) -> Result<Task, TaskError>;

    async fn complete_task(&self, user_id: &str, task_id: &str) -> Result<Task, TaskError>;

    async fn delete_task(&self, user_id: &str, task_id: &str) -> Result<(), TaskError>;
}
