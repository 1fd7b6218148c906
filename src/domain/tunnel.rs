//! 隧道相关领域模型
//!
//! 纯数据类型，无 tokio/axum 依赖

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// 写在实例标签里的端点信息，store 记录丢失后 teardown 靠它找回预留
pub const LABEL_ENDPOINT_KIND: &str = "deployify.endpoint.kind";
pub const LABEL_ENDPOINT_ID: &str = "deployify.endpoint.id";
pub const LABEL_ENDPOINT_TARGET: &str = "deployify.endpoint.target";

/// 公网端点类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelKind {
    /// 预留的 TCP 地址 (host:port)
    Tcp,
    /// 预留的 HTTP 域名
    Http,
}

impl TunnelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelKind::Tcp => "tcp",
            TunnelKind::Http => "http",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "tcp" => Some(TunnelKind::Tcp),
            "http" => Some(TunnelKind::Http),
            _ => None,
        }
    }
}

/// 预留的公网端点
///
/// 由编排器持有，只有显式回滚或 teardown 时才释放
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelEndpoint {
    pub kind: TunnelKind,
    /// TCP: "1.tcp.example.io:21034"，HTTP: "deployify-demo1.example.app"
    pub target: String,
    /// 服务商分配的预留 ID
    pub reservation_id: String,
}

impl TunnelEndpoint {
    pub fn tcp(address: impl Into<String>, reservation_id: impl Into<String>) -> Self {
        Self {
            kind: TunnelKind::Tcp,
            target: address.into(),
            reservation_id: reservation_id.into(),
        }
    }

    pub fn http(domain: impl Into<String>, reservation_id: impl Into<String>) -> Self {
        Self {
            kind: TunnelKind::Http,
            target: domain.into(),
            reservation_id: reservation_id.into(),
        }
    }

    /// 对外可访问的 URL
    pub fn public_url(&self) -> String {
        match self.kind {
            TunnelKind::Tcp => format!("tcp://{}", self.target),
            TunnelKind::Http => format!("https://{}", self.target),
        }
    }

    /// TCP 地址中的端口部分
    pub fn tcp_port(&self) -> Option<u16> {
        if self.kind != TunnelKind::Tcp {
            return None;
        }
        self.target.rsplit_once(':')?.1.parse().ok()
    }

    /// 写入实例标签
    pub fn to_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_ENDPOINT_KIND.to_string(), self.kind.as_str().to_string()),
            (LABEL_ENDPOINT_ID.to_string(), self.reservation_id.clone()),
            (LABEL_ENDPOINT_TARGET.to_string(), self.target.clone()),
        ])
    }

    /// 从实例标签恢复端点，缺任何一项都返回 `None`
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Option<Self> {
        let kind = TunnelKind::parse(labels.get(LABEL_ENDPOINT_KIND)?)?;
        let reservation_id = labels.get(LABEL_ENDPOINT_ID).filter(|id| !id.is_empty())?;
        let target = labels.get(LABEL_ENDPOINT_TARGET)?;
        Some(Self {
            kind,
            target: target.clone(),
            reservation_id: reservation_id.clone(),
        })
    }
}
