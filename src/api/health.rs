//! 健康检查 API
//!
//! 包含 /health, /status 端点

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;

use crate::config::env::constants::VERSION;
use crate::middleware::OptionalApiKey;
use crate::state::AppState;

/// 配置摘要（仅认证请求可见）
#[derive(Debug, Serialize)]
struct ConfigSummary {
    port_range: String,
    build_root: String,
    max_retries: u32,
    tunnel_domain: String,
    tunnel_api_configured: bool,
}

/// 健康检查响应
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    timestamp: String,
    uptime_secs: i64,
    active_deployments: usize,
    /// 正在占用的部署名称数
    in_flight: usize,
    sessions: usize,
    languages: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    config: Option<ConfigSummary>,
}

/// 创建健康检查路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(health_check))
}

/// 健康检查 - 返回状态、版本、活跃部署和会话数
///
/// GET /health, GET /status
/// 无需认证；带正确 API Key 时额外返回配置摘要
async fn health_check(
    auth: OptionalApiKey,
    State(state): State<Arc<AppState>>,
) -> Json<HealthResponse> {
    let config = auth.authenticated.then(|| ConfigSummary {
        port_range: format!(
            "{}-{}",
            state.config.port_range.start, state.config.port_range.end
        ),
        build_root: state.config.build.build_root.display().to_string(),
        max_retries: state.config.build.max_retries,
        tunnel_domain: state.config.tunnel.domain.clone(),
        tunnel_api_configured: !state.config.tunnel.api_key.is_empty(),
    });

    Json(HealthResponse {
        status: "ok",
        service: "deployify",
        version: VERSION,
        timestamp: chrono::Utc::now().to_rfc3339(),
        uptime_secs: state.uptime_secs(),
        active_deployments: state.store.active_count().await,
        in_flight: state.orchestrator.in_flight_count(),
        sessions: state.sessions.count().await,
        languages: state.orchestrator.languages(),
        config,
    })
}
