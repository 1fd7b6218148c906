//! 隧道控制面 HTTP Client
//!
//! 封装与隧道服务商 REST API 的交互（预留 TCP 地址 / 预留域名），复用连接池。
//! 预留操作在服务商侧不保证幂等，因此这里不做自动重试。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::env::TunnelConfig;

/// 控制面错误
#[derive(Debug, Error)]
pub enum TunnelApiError {
    /// 网络错误
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    /// 服务商返回非 2xx
    #[error("provider returned {status}: {message}")]
    Rejected { status: u16, message: String },
    /// 未配置 API 密钥
    #[error("tunnel API key is not configured")]
    NotConfigured,
}

/// 服务商分配的 TCP 地址
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ReservedAddress {
    pub id: String,
    /// "1.tcp.ngrok.io:20000"
    pub addr: String,
}

/// 服务商分配的域名
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ReservedDomain {
    pub id: String,
    pub domain: String,
}

/// 隧道控制面操作
#[async_trait]
pub trait TunnelControlPlane: Send + Sync {
    async fn reserve_address(&self, description: &str) -> Result<ReservedAddress, TunnelApiError>;

    async fn reserve_domain(
        &self,
        domain: &str,
        description: &str,
    ) -> Result<ReservedDomain, TunnelApiError>;

    async fn release_address(&self, id: &str) -> Result<(), TunnelApiError>;

    async fn release_domain(&self, id: &str) -> Result<(), TunnelApiError>;
}

/// 隧道服务商 REST 客户端
#[derive(Clone)]
pub struct TunnelApiClient {
    client: Client,
    api_url: String,
    api_key: String,
    region: String,
}

#[derive(Serialize)]
struct ReserveAddressBody<'a> {
    description: &'a str,
    region: &'a str,
}

#[derive(Serialize)]
struct ReserveDomainBody<'a> {
    domain: &'a str,
    description: &'a str,
    region: &'a str,
}

/// 服务商错误响应体
#[derive(Deserialize)]
struct ProviderError {
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    error_code: Option<String>,
}

impl TunnelApiClient {
    pub fn new(config: &TunnelConfig) -> Result<Self, TunnelApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(5)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            region: config.region.clone(),
        })
    }

    fn authorized(&self, builder: RequestBuilder) -> Result<RequestBuilder, TunnelApiError> {
        if self.api_key.is_empty() {
            return Err(TunnelApiError::NotConfigured);
        }
        Ok(builder
            .bearer_auth(&self.api_key)
            .header("Ngrok-Version", "2"))
    }

    /// 非 2xx 时提取服务商的错误消息
    async fn check(response: Response) -> Result<Response, TunnelApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<ProviderError>(&text) {
            Ok(ProviderError {
                msg: Some(msg),
                error_code,
            }) => match error_code {
                Some(code) => format!("{} ({})", msg.trim(), code),
                None => msg.trim().to_string(),
            },
            _ if text.trim().is_empty() => status.to_string(),
            _ => text.trim().to_string(),
        };
        Err(TunnelApiError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl TunnelControlPlane for TunnelApiClient {
    async fn reserve_address(&self, description: &str) -> Result<ReservedAddress, TunnelApiError> {
        let url = format!("{}/reserved_addrs", self.api_url);
        let request = self.authorized(self.client.post(&url))?.json(&ReserveAddressBody {
            description,
            region: &self.region,
        });

        let response = Self::check(request.send().await?).await?;
        let reserved: ReservedAddress = response.json().await?;
        info!(id = %reserved.id, addr = %reserved.addr, "Reserved TCP address");
        Ok(reserved)
    }

    async fn reserve_domain(
        &self,
        domain: &str,
        description: &str,
    ) -> Result<ReservedDomain, TunnelApiError> {
        let url = format!("{}/reserved_domains", self.api_url);
        let request = self.authorized(self.client.post(&url))?.json(&ReserveDomainBody {
            domain,
            description,
            region: &self.region,
        });

        let response = Self::check(request.send().await?).await?;
        let reserved: ReservedDomain = response.json().await?;
        info!(id = %reserved.id, domain = %reserved.domain, "Reserved domain");
        Ok(reserved)
    }

    async fn release_address(&self, id: &str) -> Result<(), TunnelApiError> {
        let url = format!("{}/reserved_addrs/{}", self.api_url, id);
        let request = self.authorized(self.client.delete(&url))?;
        match Self::check(request.send().await?).await {
            Ok(_) => Ok(()),
            // 已经不存在视为释放成功
            Err(TunnelApiError::Rejected { status: 404, .. }) => {
                warn!(id = %id, "Reserved address already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn release_domain(&self, id: &str) -> Result<(), TunnelApiError> {
        let url = format!("{}/reserved_domains/{}", self.api_url, id);
        let request = self.authorized(self.client.delete(&url))?;
        match Self::check(request.send().await?).await {
            Ok(_) => Ok(()),
            Err(TunnelApiError::Rejected { status: 404, .. }) => {
                warn!(id = %id, "Reserved domain already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
