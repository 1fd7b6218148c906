//! 应用状态

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::env::EnvConfig;
use crate::error::DeployError;
use crate::infra::{ContainerRuntime, DockerCli, TunnelApiClient, TunnelControlPlane};
use crate::services::DeploymentOrchestrator;

use super::deployment_store::DeploymentStore;
use super::session_registry::SessionRegistry;

/// 全局 shutdown token，用于优雅关闭所有后台任务
static GLOBAL_SHUTDOWN: std::sync::OnceLock<CancellationToken> = std::sync::OnceLock::new();

/// 获取全局 shutdown token
pub fn get_shutdown_token() -> CancellationToken {
    GLOBAL_SHUTDOWN
        .get_or_init(CancellationToken::new)
        .clone()
}

/// 触发全局 shutdown
pub fn trigger_shutdown() {
    if let Some(token) = GLOBAL_SHUTDOWN.get() {
        token.cancel();
    }
}

/// 应用状态
pub struct AppState {
    // ========== 核心配置 ==========
    /// API 密钥（用于验证请求）
    pub api_key: String,
    /// 环境配置
    pub config: EnvConfig,
    /// 服务启动时间
    pub started_at: DateTime<Utc>,

    // ========== 部署 ==========
    /// 部署编排器
    pub orchestrator: Arc<DeploymentOrchestrator>,
    /// 部署记录
    pub store: Arc<DeploymentStore>,
    /// 进度会话
    pub sessions: Arc<SessionRegistry>,
}

impl AppState {
    /// 使用 docker CLI 和隧道控制面 HTTP API 创建应用状态
    pub fn new(config: EnvConfig) -> Result<Self, DeployError> {
        tracing::info!(
            api_key_len = config.api_key.len(),
            port = config.port,
            port_range = ?config.port_range,
            docker_bin = %config.build.docker_bin,
            build_root = %config.build.build_root.display(),
            max_retries = config.build.max_retries,
            tunnel_domain = %config.tunnel.domain,
            tunnel_api_configured = !config.tunnel.api_key.is_empty(),
            "Loaded configuration"
        );

        let runtime = Arc::new(DockerCli::new(
            config.build.docker_bin.clone(),
            config.build.build_timeout,
            get_shutdown_token(),
        ));
        let control_plane = Arc::new(
            TunnelApiClient::new(&config.tunnel)
                .map_err(|e| DeployError::internal(format!("tunnel API client: {}", e)))?,
        );

        Ok(Self::with_backends(config, runtime, control_plane))
    }

    /// 使用指定的运行时和隧道控制面创建（测试中注入内存实现）
    pub fn with_backends(
        config: EnvConfig,
        runtime: Arc<dyn ContainerRuntime>,
        control_plane: Arc<dyn TunnelControlPlane>,
    ) -> Self {
        let store = Arc::new(DeploymentStore::new());
        let sessions = Arc::new(SessionRegistry::new());
        let orchestrator = Arc::new(DeploymentOrchestrator::new(
            runtime,
            control_plane,
            sessions.clone(),
            store.clone(),
            &config,
        ));

        Self {
            api_key: config.api_key.clone(),
            config,
            started_at: Utc::now(),
            orchestrator,
            store,
            sessions,
        }
    }

    /// 运行时长（秒）
    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }
}
