//! Ant - Rust 待办清单对话智能体
//!
//! 用户用自然语言管理个人任务清单；核心是无状态的对话编排层：
//! 每条消息都从持久化存储重建完整上下文，模型只能请求固定目录内的任务工具，
//! 每次工具调用都留下完整审计链（消息 -> 决策 -> 调用 -> 结果）。
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、对话锁、回合编排状态机
//! - **llm**: 模型网关抽象与实现（OpenAI 兼容 / Mock）
//! - **store**: 对话、消息与审计的 SQLite 持久化
//! - **tasks**: 任务存储契约与 SQLite 参考实现
//! - **tools**: 工具目录与派发器

pub mod config;
pub mod core;
pub mod llm;
pub mod store;
pub mod tasks;
pub mod tools;
