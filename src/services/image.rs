//! 镜像准备与构建
//!
//! 构建失败立即重试（无退避），最多 `max_retries + 1` 次；
//! 构建命令成功但本地索引里查不到 tag 也算一次失败。

use std::path::Path;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::domain::deploy::LogLine;
use crate::error::DeployError;
use crate::infra::runtime::ContainerRuntime;

/// 镜像准备
pub struct ImageProvisioner {
    runtime: Arc<dyn ContainerRuntime>,
}

impl ImageProvisioner {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// 基础镜像不在本地时拉取
    pub async fn ensure_base_image(&self, reference: &str) -> Result<(), DeployError> {
        let present = self.runtime.image_exists(reference).await.map_err(|e| {
            DeployError::ImageBuild {
                attempts: 0,
                message: format!("inspect base image {}: {}", reference, e),
            }
        })?;
        if present {
            return Ok(());
        }

        self.runtime
            .pull_image(reference)
            .await
            .map_err(|e| DeployError::ImageBuild {
                attempts: 0,
                message: format!("pull base image {}: {}", reference, e),
            })?;
        info!(image = %reference, "Base image pulled");
        Ok(())
    }

    /// 构建镜像，返回实际尝试次数
    ///
    /// 构建输出推送到 `log_tx`
    pub async fn build(
        &self,
        context_dir: &Path,
        tag: &str,
        max_retries: u32,
        log_tx: broadcast::Sender<LogLine>,
    ) -> Result<u32, DeployError> {
        let max_attempts = max_retries.saturating_add(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let _ = log_tx.send(LogLine::stdout(format!(
                    "Retrying image build ({}/{})",
                    attempt, max_attempts
                )));
            }

            match self.runtime.build_image(context_dir, tag, log_tx.clone()).await {
                Ok(()) => match self.runtime.image_exists(tag).await {
                    Ok(true) => {
                        info!(tag = %tag, attempt, "Image built");
                        return Ok(attempt);
                    }
                    Ok(false) => {
                        last_error = format!("build finished but tag {} is missing", tag);
                    }
                    Err(e) => {
                        last_error = format!("verify tag {}: {}", tag, e);
                    }
                },
                Err(e) => {
                    last_error = e.to_string();
                }
            }

            warn!(tag = %tag, attempt, max_attempts, error = %last_error, "Image build attempt failed");
        }

        Err(DeployError::ImageBuild {
            attempts: max_attempts,
            message: last_error,
        })
    }

    /// 删除镜像
    pub async fn remove(&self, tag: &str) -> Result<(), DeployError> {
        self.runtime
            .remove_image(tag)
            .await
            .map_err(|e| DeployError::internal(format!("remove image {}: {}", tag, e)))
    }
}
