//! 部署管理 API
//!
//! 包含 /deploy, /services, /deployments/*, /sessions/:session_id/progress 端点

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::{convert::Infallible, sync::Arc};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::domain::deploy::{
    DataServiceRequest, DataServiceResponse, DeployRequest, DeployResponse, DeploymentRecord,
};
use crate::error::{ApiError, ApiResult, DeployError};
use crate::middleware::RequireApiKey;
use crate::services::deploy::TeardownReport;
use crate::state::{AppState, SessionRegistry};

/// 部署历史查询参数
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    /// 返回数量限制，默认 20
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// 状态过滤 (running, succeeded, failed, removed)
    pub status: Option<String>,
}

fn default_limit() -> usize {
    20
}

/// 部署历史响应
#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub deployments: Vec<DeploymentRecord>,
    pub total: usize,
}

/// 创建部署管理路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/deploy", post(create_deployment))
        .route("/services", post(create_data_service))
        .route("/deployments", get(list_deployments))
        // GET 按部署 ID 查询，DELETE 按部署名称移除
        .route(
            "/deployments/:id",
            get(get_deployment).delete(remove_deployment),
        )
        .route("/sessions/:session_id/progress", get(stream_progress))
}

/// 部署上传的源码
///
/// POST /deploy
/// 需要 API Key
///
/// 部署在独立任务中执行，客户端断开不会中断部署
async fn create_deployment(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    payload: Result<Json<DeployRequest>, JsonRejection>,
) -> ApiResult<Json<DeployResponse>> {
    let Json(request) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let orchestrator = state.orchestrator.clone();

    let response = tokio::spawn(async move { orchestrator.deploy(request).await })
        .await
        .map_err(|e| DeployError::internal(format!("deployment task aborted: {}", e)))??;

    Ok(Json(response))
}

/// 部署数据服务 + 管理界面
///
/// POST /services
/// 需要 API Key
async fn create_data_service(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    payload: Result<Json<DataServiceRequest>, JsonRejection>,
) -> ApiResult<Json<DataServiceResponse>> {
    let Json(request) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let orchestrator = state.orchestrator.clone();

    let response = tokio::spawn(async move { orchestrator.deploy_data_service(request).await })
        .await
        .map_err(|e| DeployError::internal(format!("deployment task aborted: {}", e)))??;

    Ok(Json(response))
}

/// 移除部署
///
/// DELETE /deployments/:name
/// 需要 API Key
async fn remove_deployment(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<TeardownReport>> {
    let orchestrator = state.orchestrator.clone();
    let report = tokio::spawn(async move { orchestrator.teardown(&name).await })
        .await
        .map_err(|e| DeployError::internal(format!("teardown task aborted: {}", e)))??;

    Ok(Json(report))
}

/// 获取部署记录
///
/// GET /deployments/:id
/// 无需认证
async fn get_deployment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<DeploymentRecord>> {
    let record = state
        .store
        .get(&id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("Deployment '{}'", id)))?;

    Ok(Json(record))
}

/// 最近的部署记录
///
/// GET /deployments
/// 无需认证
async fn list_deployments(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Json<HistoryResponse> {
    let deployments = state
        .store
        .list(query.limit, query.status.as_deref())
        .await;
    let total = deployments.len();

    Json(HistoryResponse { deployments, total })
}

/// 流关闭时注销会话
struct SessionGuard {
    sessions: Arc<SessionRegistry>,
    session_id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let sessions = self.sessions.clone();
        let session_id = std::mem::take(&mut self.session_id);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                sessions.detach(&session_id).await;
                debug!(session_id = %session_id, "Progress observer detached");
            });
        }
    }
}

/// 进度事件流
///
/// GET /sessions/:session_id/progress
/// 无需认证
///
/// 连接即注册会话；收到 100 或失败事件后结束
async fn stream_progress(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.sessions.attach(&session_id).await;
    let guard = SessionGuard {
        sessions: state.sessions.clone(),
        session_id: session_id.clone(),
    };

    let stream = async_stream::stream! {
        let _guard = guard;
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let terminal = event.is_complete() || event.is_failure();
                    let json = serde_json::to_string(&event).unwrap_or_default();
                    yield Ok(Event::default().event("progress").data(json));
                    if terminal {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(session_id = %session_id, lagged = n, "Progress observer lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("keepalive"),
    )
}
