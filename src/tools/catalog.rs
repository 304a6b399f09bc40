//! 工具目录
//!
//! 运行时不可变的固定目录：五个任务管理工具的名称、描述与参数 schema（schemars 生成）。
//! 注意 user_id 不在任何参数 schema 中，身份一律由 Dispatcher 从认证上下文注入，
//! 模型输出中的身份信息永远不被采信。

use schemars::{schema_for, JsonSchema};
use serde::Deserialize;
use serde_json::Value;

use crate::llm::ToolSpec;
use crate::tasks::StatusFilter;

/// 封闭的工具名集合；Dispatcher 对其做穷尽匹配，杜绝字符串分发漏洞
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToolName {
    AddTask,
    ListTasks,
    UpdateTask,
    CompleteTask,
    DeleteTask,
}

impl ToolName {
    pub const ALL: [ToolName; 5] = [
        ToolName::AddTask,
        ToolName::ListTasks,
        ToolName::UpdateTask,
        ToolName::CompleteTask,
        ToolName::DeleteTask,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolName::AddTask => "add_task",
            ToolName::ListTasks => "list_tasks",
            ToolName::UpdateTask => "update_task",
            ToolName::CompleteTask => "complete_task",
            ToolName::DeleteTask => "delete_task",
        }
    }

    /// 解析模型给出的工具名；目录外的名字返回 None，由调用方转为可恢复错误
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == name)
    }

    pub fn description(&self) -> &'static str {
        match self {
            ToolName::AddTask => "Create a new task with a title and optional description.",
            ToolName::ListTasks => {
                "List the user's tasks, optionally filtered by status (all, pending, completed)."
            }
            ToolName::UpdateTask => {
                "Update the title and/or description of an existing task by its id."
            }
            ToolName::CompleteTask => "Mark an existing task as completed by its id.",
            ToolName::DeleteTask => "Delete an existing task by its id.",
        }
    }

    /// 该工具的参数 JSON Schema
    pub fn parameters_schema(&self) -> Value {
        let schema = match self {
            ToolName::AddTask => schema_for!(AddTaskArgs),
            ToolName::ListTasks => schema_for!(ListTasksArgs),
            ToolName::UpdateTask => schema_for!(UpdateTaskArgs),
            ToolName::CompleteTask => schema_for!(CompleteTaskArgs),
            ToolName::DeleteTask => schema_for!(DeleteTaskArgs),
        };
        serde_json::to_value(schema).unwrap_or_else(|_| serde_json::json!({"type": "object"}))
    }

    /// 是否为写操作（task_operation 摘要只关心这些）
    pub fn is_mutation(&self) -> bool {
        !matches!(self, ToolName::ListTasks)
    }
}

/// 发给模型网关的完整工具目录
pub fn catalog() -> Vec<ToolSpec> {
    ToolName::ALL
        .iter()
        .map(|tool| ToolSpec {
            name: tool.as_str().to_string(),
            description: tool.description().to_string(),
            parameters: tool.parameters_schema(),
        })
        .collect()
}

/// add_task 参数
#[derive(Debug, Deserialize, JsonSchema)]
pub struct AddTaskArgs {
    /// 任务标题
    pub title: String,
    /// 可选的补充说明
    pub description: Option<String>,
}

/// list_tasks 参数
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListTasksArgs {
    /// 状态过滤，缺省为 all
    pub status: Option<StatusFilter>,
}

/// update_task 参数；title 与 description 至少要有一个
#[derive(Debug, Deserialize, JsonSchema)]
pub struct UpdateTaskArgs {
    pub task_id: String,
    pub title: Option<String>,
    pub description: Option<String>,
}

/// complete_task 参数
#[derive(Debug, Deserialize, JsonSchema)]
pub struct CompleteTaskArgs {
    pub task_id: String,
}

/// delete_task 参数
#[derive(Debug, Deserialize, JsonSchema)]
pub struct DeleteTaskArgs {
    pub task_id: String,
}
