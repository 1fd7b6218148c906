//! 容器运行时边界
//!
//! 编排逻辑只依赖这个 trait；生产实现是 `DockerCli`，测试使用内存 fake

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::domain::container::{ContainerState, InstanceSpec};
use crate::domain::deploy::LogLine;

use super::command::CommandError;

/// 运行时错误
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("unexpected runtime output: {0}")]
    Parse(String),

    #[error("{0}")]
    Other(String),
}

/// 容器运行时操作
///
/// 所有 inspect / list 都是即时快照，不会阻塞等待外部事件
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// 本地镜像索引中是否存在该引用
    async fn image_exists(&self, reference: &str) -> Result<bool, RuntimeError>;

    /// 拉取镜像
    async fn pull_image(&self, reference: &str) -> Result<(), RuntimeError>;

    /// 基于构建上下文构建镜像，构建输出推送到 `log_tx`
    async fn build_image(
        &self,
        context_dir: &Path,
        tag: &str,
        log_tx: broadcast::Sender<LogLine>,
    ) -> Result<(), RuntimeError>;

    /// 删除镜像
    async fn remove_image(&self, reference: &str) -> Result<(), RuntimeError>;

    /// 创建实例（不启动），返回实例 ID
    async fn create_container(&self, spec: &InstanceSpec) -> Result<String, RuntimeError>;

    /// 启动已创建的实例
    async fn start_container(&self, name: &str) -> Result<(), RuntimeError>;

    /// 查询实例状态，不存在时返回 `None`
    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerState>, RuntimeError>;

    /// 停止实例
    async fn stop_container(&self, name: &str, grace: Duration) -> Result<(), RuntimeError>;

    /// 删除实例
    async fn remove_container(&self, name: &str) -> Result<(), RuntimeError>;

    /// 正在运行的实例所绑定的主机端口
    async fn used_host_ports(&self) -> Result<Vec<u16>, RuntimeError>;
}
