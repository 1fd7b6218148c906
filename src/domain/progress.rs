//! 进度事件

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 推送给观察者的进度事件
///
/// `percentage == 0` 且带消息表示终止性失败
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProgressEvent {
    pub percentage: u8,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(percentage: u8, message: impl Into<String>) -> Self {
        Self {
            percentage: percentage.min(100),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// 终止性失败事件
    pub fn failure(message: impl Into<String>) -> Self {
        Self::new(0, message)
    }

    pub fn is_failure(&self) -> bool {
        self.percentage == 0 && !self.message.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.percentage == 100
    }
}
