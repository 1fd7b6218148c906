//! 回滚账本
//!
//! 记录本次请求获取的外部资源。失败时按顺序撤销：
//! 释放端点 → 清理实例 → 删除镜像 → 删除构建上下文。
//! 撤销过程中的错误只记录，不会替换原始错误。

use std::path::PathBuf;

use tracing::{info, warn};

use crate::domain::tunnel::TunnelEndpoint;
use crate::services::image::ImageProvisioner;
use crate::services::instance::InstanceLifecycle;
use crate::services::tunnel::TunnelProvisioner;

use super::context;

/// 一次请求获取的资源
#[derive(Debug, Default)]
pub struct RollbackLedger {
    endpoints: Vec<TunnelEndpoint>,
    instances: Vec<String>,
    images: Vec<String>,
    context_dirs: Vec<PathBuf>,
}

/// 回滚结果
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RollbackReport {
    pub endpoints_released: usize,
    pub instances_cleaned: usize,
    pub images_removed: usize,
    /// 撤销失败的步骤数
    pub failures: usize,
}

impl RollbackLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_endpoint(&mut self, endpoint: TunnelEndpoint) {
        self.endpoints.push(endpoint);
    }

    /// 在 create 之前记录，start 失败的实例同样会被清理
    pub fn record_instance(&mut self, name: impl Into<String>) {
        self.instances.push(name.into());
    }

    pub fn record_image(&mut self, tag: impl Into<String>) {
        self.images.push(tag.into());
    }

    pub fn record_context(&mut self, dir: PathBuf) {
        self.context_dirs.push(dir);
    }

    pub fn endpoints(&self) -> &[TunnelEndpoint] {
        &self.endpoints
    }

    pub fn instances(&self) -> &[String] {
        &self.instances
    }

    pub fn images(&self) -> &[String] {
        &self.images
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
            && self.instances.is_empty()
            && self.images.is_empty()
            && self.context_dirs.is_empty()
    }

    /// 删除构建上下文（成功路径也会调用）
    pub async fn discard_contexts(&mut self) {
        for dir in self.context_dirs.drain(..).rev() {
            context::discard(&dir).await;
        }
    }

    /// 撤销全部资源
    pub async fn unwind(
        mut self,
        tunnels: &TunnelProvisioner,
        instances: &InstanceLifecycle,
        images: &ImageProvisioner,
    ) -> RollbackReport {
        let mut report = RollbackReport::default();

        for endpoint in self.endpoints.drain(..).rev() {
            match tunnels.release(&endpoint).await {
                Ok(()) => report.endpoints_released += 1,
                Err(e) => {
                    warn!(endpoint = %endpoint.target, error = %e, "Rollback: endpoint release failed");
                    report.failures += 1;
                }
            }
        }

        for name in self.instances.drain(..).rev() {
            instances.cleanup(&name).await;
            report.instances_cleaned += 1;
        }

        for tag in self.images.drain(..).rev() {
            match images.remove(&tag).await {
                Ok(()) => report.images_removed += 1,
                Err(e) => {
                    warn!(tag = %tag, error = %e, "Rollback: image removal failed");
                    report.failures += 1;
                }
            }
        }

        self.discard_contexts().await;

        info!(
            endpoints = report.endpoints_released,
            instances = report.instances_cleaned,
            images = report.images_removed,
            failures = report.failures,
            "Rollback finished"
        );
        report
    }
}
