//! 部署记录存储
//!
//! 保存最近的部署记录（新的在前），超过上限时丢弃最旧的

use chrono::Utc;
use std::collections::VecDeque;
use tokio::sync::RwLock;

use crate::config::env::constants::MAX_DEPLOYMENT_HISTORY;
use crate::domain::deploy::{DeployStatus, DeploymentRecord};

/// 部署记录存储
pub struct DeploymentStore {
    records: RwLock<VecDeque<DeploymentRecord>>,
    max_records: usize,
}

impl DeploymentStore {
    pub fn new() -> Self {
        Self::with_capacity(MAX_DEPLOYMENT_HISTORY)
    }

    /// 使用自定义上限创建
    pub fn with_capacity(max_records: usize) -> Self {
        Self {
            records: RwLock::new(VecDeque::new()),
            max_records,
        }
    }

    /// 插入新记录
    pub async fn insert(&self, record: DeploymentRecord) {
        let mut records = self.records.write().await;
        records.push_front(record);

        // 优先丢弃最旧的已结束记录
        while records.len() > self.max_records {
            match records.iter().rposition(|r| r.status.is_terminal()) {
                Some(index) => {
                    records.remove(index);
                }
                None => {
                    records.pop_back();
                }
            }
        }
    }

    /// 就地修改
    pub async fn update<F>(&self, id: &str, f: F) -> bool
    where
        F: FnOnce(&mut DeploymentRecord),
    {
        let mut records = self.records.write().await;
        match records.iter_mut().find(|r| r.id == id) {
            Some(record) => {
                f(record);
                if record.status.is_terminal() && record.finished_at.is_none() {
                    record.finished_at = Some(Utc::now());
                }
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, id: &str) -> Option<DeploymentRecord> {
        let records = self.records.read().await;
        records.iter().find(|r| r.id == id).cloned()
    }

    /// 该名称最近一次成功的部署
    pub async fn latest_live(&self, name: &str) -> Option<DeploymentRecord> {
        let records = self.records.read().await;
        records
            .iter()
            .find(|r| r.name == name && r.status == DeployStatus::Succeeded)
            .cloned()
    }

    /// 最近的记录，可按状态过滤
    pub async fn list(&self, limit: usize, status: Option<&str>) -> Vec<DeploymentRecord> {
        let records = self.records.read().await;
        records
            .iter()
            .filter(|r| status.map_or(true, |s| r.status.as_str() == s))
            .take(limit)
            .cloned()
            .collect()
    }

    /// 进行中的部署数量
    pub async fn active_count(&self) -> usize {
        let records = self.records.read().await;
        records
            .iter()
            .filter(|r| r.status == DeployStatus::Running)
            .count()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

impl Default for DeploymentStore {
    fn default() -> Self {
        Self::new()
    }
}
