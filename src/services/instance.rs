//! 实例生命周期
//!
//! `cleanup` 永不向外返回错误：每一步的失败只记录日志。

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::domain::container::{ContainerState, EnvVar, InstanceRecord, InstanceSpec};
use crate::error::DeployError;
use crate::infra::runtime::ContainerRuntime;

/// 实例生命周期管理
pub struct InstanceLifecycle {
    runtime: Arc<dyn ContainerRuntime>,
    stop_grace: Duration,
}

impl InstanceLifecycle {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, stop_grace: Duration) -> Self {
        Self {
            runtime,
            stop_grace,
        }
    }

    /// 实例状态快照，不存在时为 `None`
    pub async fn inspect(&self, name: &str) -> Result<Option<ContainerState>, DeployError> {
        self.runtime
            .inspect_container(name)
            .await
            .map_err(|e| DeployError::upstream(format!("inspect {}: {}", name, e)))
    }

    /// 实例是否存在（任何状态）
    pub async fn exists(&self, name: &str) -> Result<bool, DeployError> {
        Ok(self.inspect(name).await?.is_some())
    }

    /// 创建并启动
    ///
    /// 启动失败不会撤销创建，由调用方负责 `cleanup`
    pub async fn create_and_start(&self, spec: &InstanceSpec) -> Result<InstanceRecord, DeployError> {
        let container_id = self
            .runtime
            .create_container(spec)
            .await
            .map_err(|e| DeployError::instance_start(format!("create {}: {}", spec.name, e)))?;

        self.runtime
            .start_container(&spec.name)
            .await
            .map_err(|e| DeployError::instance_start(format!("start {}: {}", spec.name, e)))?;

        info!(instance = %spec.name, image = %spec.image, "Instance started");

        Ok(InstanceRecord {
            name: spec.name.clone(),
            container_id,
            image: spec.image.clone(),
            port_bindings: spec.port_bindings.clone(),
            env: EnvVar::redacted(&spec.env),
        })
    }

    /// 固定等待后检查实例仍在运行
    ///
    /// 处于重启循环的实例视为启动失败
    pub async fn verify_running(&self, name: &str, settle: Duration) -> Result<(), DeployError> {
        if !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }

        let state = self
            .runtime
            .inspect_container(name)
            .await
            .map_err(|e| DeployError::instance_start(format!("inspect {}: {}", name, e)))?;

        match state {
            Some(state) if state.is_healthy() => Ok(()),
            Some(state) => Err(DeployError::instance_start(format!(
                "{} is {} (exit code {})",
                name,
                state.status,
                state
                    .exit_code
                    .map_or_else(|| "unknown".to_string(), |c| c.to_string())
            ))),
            None => Err(DeployError::instance_start(format!(
                "{} disappeared after start",
                name
            ))),
        }
    }

    /// 停止并删除实例，不存在时什么也不做
    pub async fn cleanup(&self, name: &str) {
        match self.runtime.inspect_container(name).await {
            Ok(None) => {
                debug!(instance = %name, "Nothing to clean up");
                return;
            }
            Ok(Some(state)) if state.running => {
                if let Err(e) = self.runtime.stop_container(name, self.stop_grace).await {
                    warn!(instance = %name, error = %e, "Failed to stop instance");
                }
            }
            Ok(Some(_)) => {}
            Err(e) => {
                warn!(instance = %name, error = %e, "Failed to inspect instance, removing anyway");
            }
        }

        match self.runtime.remove_container(name).await {
            Ok(()) => info!(instance = %name, "Instance removed"),
            Err(e) => warn!(instance = %name, error = %e, "Failed to remove instance"),
        }
    }
}
