//! 统一错误处理
//!
//! - `DeployError`: 部署流水线的错误分类，编排器返回给调用方的就是它
//! - `ApiError`: 实现 `IntoResponse`，把任意错误映射成 `{ error, code }` 响应

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// 部署错误分类
///
/// Validation / Conflict / UnsupportedLanguage 在触碰任何外部资源之前返回；
/// 其余错误都会先触发回滚再返回。
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DeployError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("unsupported language '{0}'")]
    UnsupportedLanguage(String),

    #[error("upstream provisioning failed: {0}")]
    UpstreamProvisioning(String),

    #[error("image build failed after {attempts} attempt(s): {message}")]
    ImageBuild { attempts: u32, message: String },

    #[error("instance failed to start: {0}")]
    InstanceStart(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DeployError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::UpstreamProvisioning(message.into())
    }

    pub fn instance_start(message: impl Into<String>) -> Self {
        Self::InstanceStart(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// HTTP 状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            DeployError::Validation(_) | DeployError::UnsupportedLanguage(_) => {
                StatusCode::BAD_REQUEST
            }
            DeployError::Conflict(_) => StatusCode::CONFLICT,
            DeployError::UpstreamProvisioning(_) => StatusCode::BAD_GATEWAY,
            DeployError::ImageBuild { .. }
            | DeployError::InstanceStart(_)
            | DeployError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 机器可读的错误类型
    pub fn code(&self) -> &'static str {
        match self {
            DeployError::Validation(_) => "validation_error",
            DeployError::Conflict(_) => "conflict",
            DeployError::UnsupportedLanguage(_) => "unsupported_language",
            DeployError::UpstreamProvisioning(_) => "upstream_provisioning_error",
            DeployError::ImageBuild { .. } => "image_build_error",
            DeployError::InstanceStart(_) => "instance_start_error",
            DeployError::Internal(_) => "internal_error",
        }
    }

    /// 是否在分配外部资源之前就被拒绝（不需要回滚）
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            DeployError::Validation(_)
                | DeployError::Conflict(_)
                | DeployError::UnsupportedLanguage(_)
        )
    }
}

/// API 错误响应结构
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            code: code.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// 统一 API 错误类型
#[derive(Debug)]
pub enum ApiError {
    /// 401 - 未授权（API Key 无效或缺失）
    Unauthorized,
    /// 503 - 服务端未配置 API Key，拒绝所有写操作
    AuthNotConfigured,
    /// 404 - 资源未找到
    NotFound(String),
    /// 400 - 请求无效
    BadRequest(String),
    /// 部署流水线错误，状态码由错误类型决定
    Deploy(DeployError),
}

impl ApiError {
    /// 创建未授权错误
    pub fn unauthorized() -> Self {
        Self::Unauthorized
    }

    pub fn auth_not_configured() -> Self {
        Self::AuthNotConfigured
    }

    /// 创建未找到错误
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    /// 创建请求无效错误
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }
}

impl From<DeployError> for ApiError {
    fn from(err: DeployError) -> Self {
        Self::Deploy(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "Invalid or missing API key".to_string(),
            ),
            ApiError::AuthNotConfigured => (
                StatusCode::SERVICE_UNAVAILABLE,
                "auth_not_configured",
                "Server API key is not configured; set DEPLOYIFY_API_KEY".to_string(),
            ),
            ApiError::NotFound(resource) => (
                StatusCode::NOT_FOUND,
                "not_found",
                format!("{} not found", resource),
            ),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::Deploy(err) => (err.status_code(), err.code(), err.to_string()),
        };

        let body = ErrorResponse::new(code, message);
        (status, Json(body)).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Unauthorized => write!(f, "Unauthorized"),
            ApiError::AuthNotConfigured => write!(f, "API key not configured"),
            ApiError::NotFound(r) => write!(f, "Not found: {}", r),
            ApiError::BadRequest(m) => write!(f, "Bad request: {}", m),
            ApiError::Deploy(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ApiError {}

/// 便捷类型别名
pub type ApiResult<T> = Result<T, ApiError>;
