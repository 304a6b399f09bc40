//! 工具层：目录与派发
//!
//! - **catalog**: 固定工具目录（名称 / 描述 / 参数 schema）
//! - **dispatcher**: 校验并执行单次调用，归一化为 ToolResult

pub mod catalog;
pub mod dispatcher;

pub use catalog::{catalog, ToolName};
pub use dispatcher::{ToolDispatcher, ToolErrorKind, ToolResult, ToolStatus};
