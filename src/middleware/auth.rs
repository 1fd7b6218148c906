//! API Key 认证
//!
//! 部署和删除会创建或销毁容器与公网端点，只接受 `x-api-key` 与服务端配置一致的请求。
//! 服务端没有配置 key（为空或仍是占位值）时，这些请求一律拒绝，而不是放行。

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::HeaderMap, request::Parts},
};
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::config::env::constants::DEFAULT_API_KEY;
use crate::error::ApiError;
use crate::state::AppState;

const API_KEY_HEADER: &str = "x-api-key";

/// 写操作的认证 Extractor
///
/// ```ignore
/// async fn create_deployment(
///     _auth: RequireApiKey,
///     State(state): State<Arc<AppState>>,
/// ) -> ApiResult<Json<DeployResponse>> { ... }
/// ```
#[derive(Debug, Clone)]
pub struct RequireApiKey;

#[async_trait]
impl FromRequestParts<Arc<AppState>> for RequireApiKey {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        verify_api_key(&parts.headers, &state.api_key)
    }
}

/// 服务端是否配置了真正的 key
pub fn is_configured(expected_key: &str) -> bool {
    !expected_key.is_empty() && expected_key != DEFAULT_API_KEY
}

/// 常数时间比较，长度不同直接判为不匹配
fn keys_match(provided: &str, expected: &str) -> bool {
    let (provided, expected) = (provided.as_bytes(), expected.as_bytes());
    if provided.len() != expected.len() {
        return false;
    }
    provided.ct_eq(expected).into()
}

fn provided_key(headers: &HeaderMap) -> Option<&str> {
    headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok())
}

/// 校验 `x-api-key`
pub fn verify_api_key(headers: &HeaderMap, expected_key: &str) -> Result<RequireApiKey, ApiError> {
    if !is_configured(expected_key) {
        tracing::warn!("Refusing authenticated request: server API key is not configured");
        return Err(ApiError::auth_not_configured());
    }

    match provided_key(headers) {
        Some(key) if keys_match(key, expected_key) => Ok(RequireApiKey),
        Some(_) => {
            tracing::warn!("Invalid API key provided");
            Err(ApiError::unauthorized())
        }
        None => {
            tracing::warn!("Missing x-api-key header");
            Err(ApiError::unauthorized())
        }
    }
}

/// 只读接口用：不要求 key，带了就必须正确
///
/// 服务端未配置 key 时永远是未认证
#[derive(Debug, Clone)]
pub struct OptionalApiKey {
    pub authenticated: bool,
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for OptionalApiKey {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        if !is_configured(&state.api_key) {
            return Ok(OptionalApiKey {
                authenticated: false,
            });
        }

        match provided_key(&parts.headers) {
            Some(key) if keys_match(key, &state.api_key) => {
                Ok(OptionalApiKey { authenticated: true })
            }
            Some(_) => {
                tracing::warn!("Invalid API key provided");
                Err(ApiError::unauthorized())
            }
            None => Ok(OptionalApiKey {
                authenticated: false,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{HeaderValue, Method, Request, StatusCode};
    use axum::Router;
    use tower::ServiceExt;

    use crate::api;
    use crate::testing::{scratch_dir, test_config, FakeRuntime, FakeTunnel};

    fn headers(key: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_static(key));
        headers
    }

    fn app(api_key: &str) -> Router {
        let mut config = test_config(&scratch_dir("auth"));
        config.api_key = api_key.to_string();
        api::router(Arc::new(AppState::with_backends(
            config,
            FakeRuntime::new(),
            FakeTunnel::new(),
        )))
    }

    fn request(method: Method, uri: &str, key: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(key) = key {
            builder = builder.header(API_KEY_HEADER, key);
        }
        builder
            .body(Body::from(r#"{"name":"demo1","language":"nodejs","files":[]}"#))
            .unwrap()
    }

    #[test]
    fn test_verify_api_key() {
        assert!(verify_api_key(&headers("test-key"), "test-key").is_ok());
        assert!(matches!(
            verify_api_key(&headers("wrong-key"), "test-key"),
            Err(ApiError::Unauthorized)
        ));
        assert!(matches!(
            verify_api_key(&headers("test-ke"), "test-key"),
            Err(ApiError::Unauthorized)
        ));
        assert!(matches!(
            verify_api_key(&HeaderMap::new(), "test-key"),
            Err(ApiError::Unauthorized)
        ));
    }

    #[test]
    fn test_unconfigured_key_accepts_nothing() {
        assert!(!is_configured(""));
        assert!(!is_configured(DEFAULT_API_KEY));
        assert!(matches!(
            verify_api_key(&headers("change-me-in-production"), DEFAULT_API_KEY),
            Err(ApiError::AuthNotConfigured)
        ));
        assert!(matches!(
            verify_api_key(&HeaderMap::new(), ""),
            Err(ApiError::AuthNotConfigured)
        ));
    }

    #[tokio::test]
    async fn test_mutating_routes_reject_wrong_key() {
        for (method, uri) in [(Method::POST, "/deploy"), (Method::DELETE, "/deployments/demo1")] {
            let response = app("test-key")
                .oneshot(request(method.clone(), uri, Some("wrong-key")))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{} {}", method, uri);
        }
    }

    #[tokio::test]
    async fn test_mutating_routes_refused_with_default_key() {
        for (method, uri) in [(Method::POST, "/deploy"), (Method::DELETE, "/deployments/demo1")] {
            let response = app(DEFAULT_API_KEY)
                .oneshot(request(method.clone(), uri, Some(DEFAULT_API_KEY)))
                .await
                .unwrap();
            assert_eq!(
                response.status(),
                StatusCode::SERVICE_UNAVAILABLE,
                "{} {}",
                method,
                uri
            );
        }
    }

    #[tokio::test]
    async fn test_health_stays_open_without_configured_key() {
        let response = app("")
            .oneshot(request(Method::GET, "/health", Some("anything")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
