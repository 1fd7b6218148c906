//! Deployify - 源码到公网地址的部署代理
//!
//! 上传源码 + 语言标签 → 构建镜像 → 启动实例 → 通过预留的隧道端点对外暴露

pub mod error;
pub mod middleware;
pub mod infra;
pub mod domain;
pub mod config;
pub mod state;
pub mod api;
pub mod services;

#[cfg(test)]
pub mod testing;

use std::sync::Arc;

use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::env::{constants::VERSION, EnvConfig};
use crate::state::app_state::{get_shutdown_token, trigger_shutdown};
use crate::state::AppState;

/// 命令行覆盖的运行参数
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// 覆盖 PORT 环境变量
    pub port_override: Option<u16>,
}

/// 初始化日志、加载配置并运行 HTTP 服务，直到收到退出信号
pub async fn init_and_run_with_config(
    runtime: RuntimeConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(version = VERSION, "Deployify starting");

    let mut config = EnvConfig::from_env();
    if let Some(port) = runtime.port_override {
        info!(port, "Port overridden from command line");
        config.port = port;
    }

    tokio::fs::create_dir_all(&config.build.build_root).await?;

    let port = config.port;
    let state = Arc::new(AppState::new(config)?);
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(addr = %listener.local_addr()?, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Deployify stopped");
    Ok(())
}

/// 等待 Ctrl+C / SIGTERM，然后触发全局 shutdown
async fn shutdown_signal() {
    let token = get_shutdown_token();
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
        () = token.cancelled() => info!("Shutdown requested"),
    }

    trigger_shutdown();
}
