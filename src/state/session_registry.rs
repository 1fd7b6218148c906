//! 进度会话注册表
//!
//! session_id -> 广播通道。观察者连接时插入，断开时移除；
//! 会话的生命周期与它所报告的部署无关。

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};

use crate::domain::progress::ProgressEvent;

/// 进度通道容量
const PROGRESS_CHANNEL_CAPACITY: usize = 256;

/// 会话信息
struct Session {
    sender: broadcast::Sender<ProgressEvent>,
    attached_at: DateTime<Utc>,
}

/// 会话注册表
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// 观察者连接，返回接收者
    ///
    /// 同一会话允许多个观察者
    pub async fn attach(&self, session_id: &str) -> broadcast::Receiver<ProgressEvent> {
        let mut sessions = self.sessions.write().await;

        if let Some(session) = sessions.get(session_id) {
            return session.sender.subscribe();
        }

        let (sender, receiver) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        sessions.insert(
            session_id.to_string(),
            Session {
                sender,
                attached_at: Utc::now(),
            },
        );
        tracing::debug!(session_id = %session_id, "Progress session attached");

        receiver
    }

    /// 观察者断开
    ///
    /// 只有当没有任何存活的接收者时才移除会话
    pub async fn detach(&self, session_id: &str) {
        let mut sessions = self.sessions.write().await;
        let idle = sessions
            .get(session_id)
            .map_or(false, |s| s.sender.receiver_count() == 0);
        if idle {
            if let Some(session) = sessions.remove(session_id) {
                let attached_for = Utc::now() - session.attached_at;
                tracing::debug!(
                    session_id = %session_id,
                    attached_secs = attached_for.num_seconds(),
                    "Progress session detached"
                );
            }
        }
    }

    /// 查找会话的发送者
    pub async fn lookup(&self, session_id: &str) -> Option<broadcast::Sender<ProgressEvent>> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).map(|s| s.sender.clone())
    }

    /// 检查会话是否存在
    pub async fn exists(&self, session_id: &str) -> bool {
        let sessions = self.sessions.read().await;
        sessions.contains_key(session_id)
    }

    /// 会话数量
    pub async fn count(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
