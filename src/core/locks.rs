//! 对话级别的串行化锁
//!
//! 同一对话的两个并发请求必须串行持久化，否则历史会交错；不同对话互不影响。
//! 进程内使用按对话 id 的 advisory lock，配合 conversations.revision 乐观检查。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// 按对话 id 维护的锁表；锁只在请求期间持有，不构成跨请求的会话状态
#[derive(Default)]
pub struct ConversationLocks {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取指定对话的锁；guard 释放后其他等待请求方可继续
    pub async fn acquire(&self, conversation_id: &str) -> OwnedMutexGuard<()> {
        let entry = {
            let mut map = self.inner.lock().expect("lock map poisoned");
            // 顺手清掉无人等待的旧条目，防止锁表无界增长
            map.retain(|id, m| id == conversation_id || Arc::strong_count(m) > 1);
            map.entry(conversation_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        entry.lock_owned().await
    }
}
