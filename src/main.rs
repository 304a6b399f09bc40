//! Ant - 待办清单对话智能体
//!
//! 入口：初始化日志与存储，为本地用户启动一个逐行 REPL。
//! 每一行都是一次完整的独立回合，进程在任意两行之间重启不丢上下文。

use std::io::{BufRead, Write};
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ant::config::{load_config, AppConfig};
use ant::core::{ChatRequest, Orchestrator};
use ant::llm::{ChatModel, MockChatModel, OpenAiChatModel};
use ant::store::{connect_sqlite, AuditLog, ConversationStore};
use ant::tasks::SqliteTaskStore;
use ant::tools::ToolDispatcher;

/// 根据配置与环境变量选择模型后端（OpenAI 兼容 / DeepSeek / Mock）
fn create_model_from_config(cfg: &AppConfig) -> Arc<dyn ChatModel> {
    let provider = cfg.llm.provider.to_lowercase();
    let deepseek_key = std::env::var("DEEPSEEK_API_KEY").ok();
    let openai_key = std::env::var("OPENAI_API_KEY").ok();

    if provider == "deepseek" && deepseek_key.is_some() {
        tracing::info!("Using DeepSeek model ({})", cfg.llm.model);
        Arc::new(OpenAiChatModel::new(
            Some("https://api.deepseek.com/v1"),
            &cfg.llm.model,
            deepseek_key.as_deref(),
            cfg.llm.timeouts.request,
        ))
    } else if openai_key.is_some() {
        tracing::info!("Using OpenAI-compatible model ({})", cfg.llm.model);
        Arc::new(OpenAiChatModel::new(
            cfg.llm.base_url.as_deref(),
            &cfg.llm.model,
            openai_key.as_deref(),
            cfg.llm.timeouts.request,
        ))
    } else {
        tracing::warn!("No API key set, using mock model");
        Arc::new(MockChatModel::new())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 日志：默认 info，可通过 RUST_LOG 覆盖
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with(fmt::layer())
        .init();

    let cfg = load_config(None).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    if let Some(parent) = cfg.app.db_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let pool = connect_sqlite(&cfg.app.db_path)
        .await
        .context("Failed to open database")?;

    let store = Arc::new(ConversationStore::new(pool.clone()).await?);
    let audit = Arc::new(AuditLog::new(pool.clone()).await?);
    let tasks = Arc::new(SqliteTaskStore::new(pool).await?);
    let model = create_model_from_config(&cfg);

    let orchestrator = Orchestrator::new(
        store.clone(),
        audit,
        ToolDispatcher::new(tasks),
        model,
        cfg.agent_settings(),
    );

    let user_id = cfg.app.user_id.clone();
    println!("Ant task assistant. /new starts a fresh conversation, /history lists past ones, /quit exits.");

    // 对话 id 只是客户端的续聊凭据，服务端每回合都从存储重建上下文
    let mut conversation_id: Option<String> = None;
    let stdin = std::io::stdin();
    loop {
        print!("> ");
        std::io::stdout().flush().ok();

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line {
            "/quit" => break,
            "/new" => {
                conversation_id = None;
                println!("(new conversation)");
                continue;
            }
            "/history" => {
                for conv in store.list(&user_id).await? {
                    println!(
                        "{}  {}  {}",
                        conv.updated_at.format("%Y-%m-%d %H:%M"),
                        conv.id,
                        conv.title.unwrap_or_default()
                    );
                }
                continue;
            }
            _ => {}
        }

        let request = ChatRequest {
            user_id: user_id.clone(),
            conversation_id: conversation_id.clone(),
            message: line.to_string(),
        };

        match orchestrator
            .handle_message(request, CancellationToken::new())
            .await
        {
            Ok(response) => {
                conversation_id = Some(response.conversation_id.clone());
                for call in &response.tool_calls {
                    println!("  [{}] {:?}", call.tool, call.status);
                }
                println!("{}", response.response);
            }
            Err(e) => {
                tracing::error!("turn failed: {e}");
                println!("{}", e.user_message());
            }
        }
    }

    Ok(())
}
