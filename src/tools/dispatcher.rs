//! 工具派发器
//!
//! dispatch(user_id, tool_name, parameters) -> ToolResult：校验工具名与参数、
//! 对任务存储恰好调用一次、把成功与领域错误统一归一化为结构化结果。
//! 未知工具与参数错误都是可恢复的失败结果而非硬错误，留给模型在回合内自行纠正；
//! 派发器自身从不重试，重试是否发生由模型在下一轮决定，保证审计如实。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tasks::{TaskError, TaskStore, TaskUpdate};
use crate::tools::catalog::{
    AddTaskArgs, CompleteTaskArgs, DeleteTaskArgs, ListTasksArgs, ToolName, UpdateTaskArgs,
};

/// 工具调用结果状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Success,
    Error,
}

/// 失败分类；随结果一并审计
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    UnknownTool,
    InvalidArguments,
    NotFound,
    Forbidden,
    Conflict,
    Internal,
}

/// 归一化的工具调用结果；成功带 data，失败带分类与说明
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolResult {
    pub status: ToolStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ToolErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ToolResult {
    pub fn success(data: Value) -> Self {
        Self {
            status: ToolStatus::Success,
            data: Some(data),
            error_kind: None,
            message: None,
        }
    }

    pub fn failure(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Error,
            data: None,
            error_kind: Some(kind),
            message: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ToolStatus::Success
    }

    /// 作为 tool 消息内容回传给模型的 JSON 文本
    pub fn to_model_payload(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{\"status\":\"error\"}".to_string())
    }
}

/// 工具派发器；持有任务存储，身份参数只来自这里的 user_id 入参
pub struct ToolDispatcher {
    tasks: Arc<dyn TaskStore>,
}

impl ToolDispatcher {
    pub fn new(tasks: Arc<dyn TaskStore>) -> Self {
        Self { tasks }
    }

    /// 执行一次工具调用。对下游最多产生一次调用；所有失败路径都返回结构化结果。
    pub async fn dispatch(&self, user_id: &str, tool_name: &str, parameters: Value) -> ToolResult {
        let Some(tool) = ToolName::parse(tool_name) else {
            tracing::warn!(tool = tool_name, "model requested unknown tool");
            return ToolResult::failure(
                ToolErrorKind::UnknownTool,
                format!("Unknown tool '{tool_name}'. Available tools: add_task, list_tasks, update_task, complete_task, delete_task."),
            );
        };

        tracing::debug!(
            tool = tool.as_str(),
            args = %args_preview(&parameters),
            "dispatching tool call"
        );

        match tool {
            ToolName::AddTask => {
                let args: AddTaskArgs = match parse_args(parameters) {
                    Ok(a) => a,
                    Err(r) => return r,
                };
                if args.title.trim().is_empty() {
                    return ToolResult::failure(
                        ToolErrorKind::InvalidArguments,
                        "title must not be empty",
                    );
                }
                self.wrap(
                    self.tasks
                        .create_task(user_id, args.title.trim(), args.description.as_deref())
                        .await,
                )
            }
            ToolName::ListTasks => {
                let args: ListTasksArgs = match parse_args(parameters) {
                    Ok(a) => a,
                    Err(r) => return r,
                };
                self.wrap(
                    self.tasks
                        .list_tasks(user_id, args.status.unwrap_or_default())
                        .await,
                )
            }
            ToolName::UpdateTask => {
                let args: UpdateTaskArgs = match parse_args(parameters) {
                    Ok(a) => a,
                    Err(r) => return r,
                };
                if args.title.is_none() && args.description.is_none() {
                    return ToolResult::failure(
                        ToolErrorKind::InvalidArguments,
                        "update_task needs at least one of title or description",
                    );
                }
                self.wrap(
                    self.tasks
                        .update_task(
                            user_id,
                            &args.task_id,
                            TaskUpdate {
                                title: args.title,
                                description: args.description,
                            },
                        )
                        .await,
                )
            }
            ToolName::CompleteTask => {
                let args: CompleteTaskArgs = match parse_args(parameters) {
                    Ok(a) => a,
                    Err(r) => return r,
                };
                self.wrap(self.tasks.complete_task(user_id, &args.task_id).await)
            }
            ToolName::DeleteTask => {
                let args: DeleteTaskArgs = match parse_args(parameters) {
                    Ok(a) => a,
                    Err(r) => return r,
                };
                match self.tasks.delete_task(user_id, &args.task_id).await {
                    Ok(()) => ToolResult::success(serde_json::json!({"deleted": args.task_id})),
                    Err(e) => task_error(e),
                }
            }
        }
    }

    fn wrap<T: Serialize>(&self, result: Result<T, TaskError>) -> ToolResult {
        match result {
            Ok(value) => match serde_json::to_value(value) {
                Ok(data) => ToolResult::success(data),
                Err(e) => ToolResult::failure(ToolErrorKind::Internal, e.to_string()),
            },
            Err(e) => task_error(e),
        }
    }
}

/// 参数反序列化；失败转为 InvalidArguments 且带字段级说明
fn parse_args<T: serde::de::DeserializeOwned>(parameters: Value) -> Result<T, ToolResult> {
    serde_json::from_value(parameters).map_err(|e| {
        ToolResult::failure(
            ToolErrorKind::InvalidArguments,
            format!("invalid arguments: {e}"),
        )
    })
}

/// 领域错误归一化。越权与不存在给模型同一句「not found」，不泄露他人数据存在性。
fn task_error(err: TaskError) -> ToolResult {
    match err {
        TaskError::NotFound(id) => {
            ToolResult::failure(ToolErrorKind::NotFound, format!("task '{id}' not found"))
        }
        TaskError::Forbidden => ToolResult::failure(ToolErrorKind::Forbidden, "task not found"),
        TaskError::AlreadyCompleted(id) => ToolResult::failure(
            ToolErrorKind::Conflict,
            format!("task '{id}' is already completed"),
        ),
        TaskError::Storage(e) => ToolResult::failure(ToolErrorKind::Internal, e.to_string()),
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
