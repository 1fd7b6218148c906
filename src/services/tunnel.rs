//! 公网端点预留
//!
//! 控制面错误统一转换成 UpstreamProvisioning；预留操作不重试。

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::env::TunnelConfig;
use crate::domain::tunnel::{TunnelEndpoint, TunnelKind};
use crate::error::DeployError;
use crate::infra::tunnel_api::TunnelControlPlane;

/// 端点预留与 agent 配置生成
pub struct TunnelProvisioner {
    control_plane: Arc<dyn TunnelControlPlane>,
    /// 预留域名的后缀
    domain: String,
    /// 写入 agent 配置的令牌
    authtoken: String,
}

impl TunnelProvisioner {
    pub fn new(control_plane: Arc<dyn TunnelControlPlane>, config: &TunnelConfig) -> Self {
        Self {
            control_plane,
            domain: config.domain.clone(),
            authtoken: config.authtoken.clone(),
        }
    }

    /// `{label}.{domain}`
    pub fn domain_for(&self, label: &str) -> String {
        format!("{}.{}", label, self.domain)
    }

    /// 预留 TCP 地址
    pub async fn reserve_address(&self, label: &str) -> Result<TunnelEndpoint, DeployError> {
        let reserved = self
            .control_plane
            .reserve_address(label)
            .await
            .map_err(|e| DeployError::upstream(format!("reserve TCP address: {}", e)))?;

        info!(label = %label, addr = %reserved.addr, "TCP endpoint reserved");
        Ok(TunnelEndpoint::tcp(reserved.addr, reserved.id))
    }

    /// 预留 HTTP 域名
    pub async fn reserve_domain(&self, label: &str) -> Result<TunnelEndpoint, DeployError> {
        let domain = self.domain_for(label);
        let reserved = self
            .control_plane
            .reserve_domain(&domain, label)
            .await
            .map_err(|e| DeployError::upstream(format!("reserve domain {}: {}", domain, e)))?;

        info!(label = %label, domain = %reserved.domain, "HTTP endpoint reserved");
        Ok(TunnelEndpoint::http(reserved.domain, reserved.id))
    }

    /// 按类型预留
    pub async fn reserve(&self, kind: TunnelKind, label: &str) -> Result<TunnelEndpoint, DeployError> {
        match kind {
            TunnelKind::Tcp => self.reserve_address(label).await,
            TunnelKind::Http => self.reserve_domain(label).await,
        }
    }

    /// 释放预留，错误原样返回给调用方
    pub async fn release(&self, endpoint: &TunnelEndpoint) -> Result<(), DeployError> {
        let result = match endpoint.kind {
            TunnelKind::Tcp => self.control_plane.release_address(&endpoint.reservation_id).await,
            TunnelKind::Http => self.control_plane.release_domain(&endpoint.reservation_id).await,
        };
        match result {
            Ok(()) => {
                info!(endpoint = %endpoint.target, "Endpoint released");
                Ok(())
            }
            Err(e) => {
                warn!(endpoint = %endpoint.target, error = %e, "Endpoint release failed");
                Err(DeployError::upstream(format!(
                    "release {}: {}",
                    endpoint.target, e
                )))
            }
        }
    }

    /// 使用本实例的令牌生成 agent 配置
    pub fn agent_config(&self, endpoint: &TunnelEndpoint, local_port: u16) -> String {
        render_config(&self.authtoken, endpoint, local_port)
    }
}

/// 双引号 YAML 标量
fn yaml_quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// 生成 tunnel agent 的 YAML 配置
pub fn render_config(auth_token: &str, endpoint: &TunnelEndpoint, local_port: u16) -> String {
    let mut yaml = String::new();
    yaml.push_str("version: \"2\"\n");
    yaml.push_str(&format!("authtoken: {}\n", yaml_quote(auth_token)));
    yaml.push_str("tunnels:\n");
    yaml.push_str("  app:\n");
    yaml.push_str(&format!("    proto: {}\n", endpoint.kind.as_str()));
    yaml.push_str(&format!("    addr: {}\n", local_port));
    match endpoint.kind {
        TunnelKind::Tcp => {
            yaml.push_str(&format!("    remote_addr: {}\n", yaml_quote(&endpoint.target)))
        }
        TunnelKind::Http => {
            yaml.push_str(&format!("    domain: {}\n", yaml_quote(&endpoint.target)))
        }
    }
    yaml
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTunnel;

    fn config() -> TunnelConfig {
        TunnelConfig {
            api_url: String::new(),
            api_key: "k".into(),
            authtoken: "tok".into(),
            domain: "ngrok.app".into(),
            region: "us".into(),
        }
    }

    #[test]
    fn test_render_http_config() {
        let endpoint = TunnelEndpoint::http("deployify-demo1.ngrok.app", "rd_1");
        let yaml = render_config("abc", &endpoint, 3000);
        assert_eq!(
            yaml,
            "version: \"2\"\nauthtoken: \"abc\"\ntunnels:\n  app:\n    proto: http\n    addr: 3000\n    domain: \"deployify-demo1.ngrok.app\"\n"
        );
    }

    #[test]
    fn test_render_tcp_config() {
        let endpoint = TunnelEndpoint::tcp("1.tcp.ngrok.io:20001", "ra_1");
        let yaml = render_config("a\"b", &endpoint, 5432);
        assert!(yaml.contains("authtoken: \"a\\\"b\"\n"));
        assert!(yaml.contains("proto: tcp\n"));
        assert!(yaml.contains("remote_addr: \"1.tcp.ngrok.io:20001\"\n"));
        assert!(!yaml.contains("domain:"));
    }

    #[tokio::test]
    async fn test_reserve_and_release() {
        let tunnel = FakeTunnel::new();
        let provisioner = TunnelProvisioner::new(tunnel.clone(), &config());

        let http = provisioner.reserve_domain("deployify-demo1").await.unwrap();
        assert_eq!(http.public_url(), "https://deployify-demo1.ngrok.app");
        let tcp = provisioner.reserve(TunnelKind::Tcp, "deployify-db").await.unwrap();
        assert!(tcp.tcp_port().is_some());
        assert_eq!(tunnel.reserved_count(), 2);

        provisioner.release(&http).await.unwrap();
        provisioner.release(&tcp).await.unwrap();
        assert_eq!(tunnel.reserved_count(), 0);
    }

    #[tokio::test]
    async fn test_reservation_failure_is_upstream() {
        let tunnel = FakeTunnel::new();
        tunnel.state().fail_reserve_domain = true;
        let provisioner = TunnelProvisioner::new(tunnel, &config());

        let err = provisioner.reserve_domain("deployify-x").await.unwrap_err();
        match err {
            DeployError::UpstreamProvisioning(msg) => {
                assert!(msg.contains("already reserved"), "{}", msg)
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_release_failure_is_reported() {
        let tunnel = FakeTunnel::new();
        let provisioner = TunnelProvisioner::new(tunnel.clone(), &config());
        let endpoint = provisioner.reserve_address("x").await.unwrap();

        tunnel.state().fail_release = true;
        assert!(provisioner.release(&endpoint).await.is_err());
    }
}
