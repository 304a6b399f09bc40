//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `ANT__*` 覆盖（双下划线表示嵌套，如 `ANT__LLM__MODEL=gpt-4o`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub agent: AgentSection,
}

/// [app] 段：数据库路径与本地 REPL 用户
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    /// SQLite 数据库文件，父目录不存在时自动创建
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// REPL 绑定的已认证用户 id
    #[serde(default = "default_user_id")]
    pub user_id: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            user_id: default_user_id(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/ant.db")
}

fn default_user_id() -> String {
    "local".to_string()
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：openai / deepseek；优先级由 API Key 与 provider 共同决定
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    pub timeouts: LlmTimeoutsSection,
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    /// 单次模型调用硬超时（秒），独立于任何对外超时
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    10
}

/// [agent] 段：回合上限、重试与消息长度
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_turn_limit")]
    pub turn_limit: usize,
    #[serde(default = "default_provider_max_retries")]
    pub provider_max_retries: usize,
    #[serde(default = "default_provider_backoff_ms")]
    pub provider_backoff_ms: u64,
    #[serde(default = "default_provider_backoff_cap_ms")]
    pub provider_backoff_cap_ms: u64,
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,
    /// 为空时使用内置系统提示词
    pub system_prompt: Option<String>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            turn_limit: default_turn_limit(),
            provider_max_retries: default_provider_max_retries(),
            provider_backoff_ms: default_provider_backoff_ms(),
            provider_backoff_cap_ms: default_provider_backoff_cap_ms(),
            max_message_chars: default_max_message_chars(),
            system_prompt: None,
        }
    }
}

fn default_turn_limit() -> usize {
    4
}

fn default_provider_max_retries() -> usize {
    2
}

fn default_provider_backoff_ms() -> u64 {
    500
}

fn default_provider_backoff_cap_ms() -> u64 {
    2000
}

fn default_max_message_chars() -> usize {
    10_000
}

impl AppConfig {
    /// 转为编排参数
    pub fn agent_settings(&self) -> crate::core::AgentSettings {
        crate::core::AgentSettings {
            turn_limit: self.agent.turn_limit,
            provider_max_retries: self.agent.provider_max_retries,
            provider_backoff_ms: self.agent.provider_backoff_ms,
            provider_backoff_cap_ms: self.agent.provider_backoff_cap_ms,
            max_message_chars: self.agent.max_message_chars,
            system_prompt: self
                .agent
                .system_prompt
                .clone()
                .unwrap_or_else(|| crate::core::DEFAULT_SYSTEM_PROMPT.to_string()),
        }
    }
}

/// 从 config 目录加载配置，环境变量 ANT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 ANT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("ANT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.agent.turn_limit, 4);
        assert_eq!(cfg.agent.provider_max_retries, 2);
        assert_eq!(cfg.llm.timeouts.request, 10);
        assert_eq!(cfg.agent.max_message_chars, 10_000);
        assert_eq!(cfg.app.user_id, "local");
    }

    #[test]
    fn test_agent_settings_uses_builtin_prompt_when_unset() {
        let cfg = AppConfig::default();
        let settings = cfg.agent_settings();
        assert!(settings.system_prompt.contains("add_task"));
    }
}
