//! 进度推送
//!
//! `ProgressChannel` 按 session_id 查找观察者并转发，找不到时静默丢弃。
//! `ProgressReporter` 属于单个部署，保证百分比不回退，`(0, msg)` 之后不再发送。

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::domain::progress::ProgressEvent;
use crate::state::SessionRegistry;

/// 进度通道
#[derive(Clone)]
pub struct ProgressChannel {
    sessions: Arc<SessionRegistry>,
}

impl ProgressChannel {
    pub fn new(sessions: Arc<SessionRegistry>) -> Self {
        Self { sessions }
    }

    /// 发送事件，返回是否有观察者收到
    pub async fn send(&self, session_id: &str, percentage: u8, message: &str) -> bool {
        let Some(sender) = self.sessions.lookup(session_id).await else {
            return false;
        };
        if sender.receiver_count() == 0 {
            return false;
        }
        sender.send(ProgressEvent::new(percentage, message)).is_ok()
    }

    /// 为一次部署创建 reporter
    pub fn reporter(&self, session_id: Option<String>) -> ProgressReporter {
        ProgressReporter {
            channel: self.clone(),
            session_id: session_id.filter(|s| !s.trim().is_empty()),
            shared: Arc::new(Mutex::new(ReporterState::default())),
            window: (0, 100),
        }
    }
}

#[derive(Default)]
struct ReporterState {
    last: u8,
    finished: bool,
}

/// 单次部署的进度上报
///
/// 克隆体共享同一个状态；`scoped` 把 0..=100 映射到子区间，用于双实例流程
#[derive(Clone)]
pub struct ProgressReporter {
    channel: ProgressChannel,
    session_id: Option<String>,
    shared: Arc<Mutex<ReporterState>>,
    window: (u8, u8),
}

impl ProgressReporter {
    /// 同一部署的子区间 reporter
    pub fn scoped(&self, start: u8, end: u8) -> ProgressReporter {
        ProgressReporter {
            channel: self.channel.clone(),
            session_id: self.session_id.clone(),
            shared: self.shared.clone(),
            window: (self.map(start), self.map(end.max(start))),
        }
    }

    fn map(&self, percentage: u8) -> u8 {
        let (start, end) = self.window;
        start + ((end - start) as u16 * percentage.min(100) as u16 / 100) as u8
    }

    /// 决定下一个要发送的百分比；已结束时返回 None
    fn advance(&self, percentage: Option<u8>) -> Option<u8> {
        let mut state = match self.shared.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.finished {
            return None;
        }
        if let Some(p) = percentage {
            state.last = state.last.max(self.map(p));
        }
        Some(state.last)
    }

    async fn emit(&self, percentage: u8, message: &str) {
        if let Some(session_id) = &self.session_id {
            if !self.channel.send(session_id, percentage, message).await {
                debug!(session_id = %session_id, percentage, "No observer for progress event");
            }
        }
    }

    /// 上报进度（区间内的百分比）
    pub async fn report(&self, percentage: u8, message: &str) {
        if let Some(p) = self.advance(Some(percentage)) {
            self.emit(p, message).await;
        }
    }

    /// 以当前百分比转发一行构建输出
    pub async fn log(&self, line: &str) {
        if let Some(p) = self.advance(None) {
            self.emit(p, line).await;
        }
    }

    /// 发送 100 并结束
    pub async fn complete(&self, message: &str) {
        if self.finish() {
            self.emit(100, message).await;
        }
    }

    /// 发送终止性失败 `(0, message)` 并结束
    pub async fn fail(&self, message: &str) {
        if self.finish() {
            self.emit(0, message).await;
        }
    }

    fn finish(&self) -> bool {
        let mut state = match self.shared.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.finished {
            return false;
        }
        state.finished = true;
        true
    }
}
