//! 容器（运行实例）相关领域模型

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// 主机端口到容器端口的绑定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub host_port: u16,
    pub container_port: u16,
}

impl PortBinding {
    pub fn new(host_port: u16, container_port: u16) -> Self {
        Self {
            host_port,
            container_port,
        }
    }

    /// docker `-p` 参数格式
    pub fn to_publish_arg(&self) -> String {
        format!("{}:{}", self.host_port, self.container_port)
    }
}

/// 创建实例所需的参数
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceSpec {
    /// 实例名称（由请求名称确定性生成）
    pub name: String,
    /// 镜像 tag
    pub image: String,
    pub port_bindings: Vec<PortBinding>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    /// `host:ip` 额外的 hosts 条目
    pub extra_hosts: Vec<String>,
}

/// 已创建的实例
#[derive(Debug, Clone, Serialize)]
pub struct InstanceRecord {
    pub name: String,
    pub container_id: String,
    pub image: String,
    pub port_bindings: Vec<PortBinding>,
    /// 敏感变量已脱敏
    pub env: Vec<EnvVar>,
}

/// 实例状态快照（来自 inspect）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerState {
    pub running: bool,
    /// 重启策略正在拉起已退出的进程（崩溃循环时 running 也可能为 true）
    pub restarting: bool,
    /// "created" | "running" | "restarting" | "exited" | ...
    pub status: String,
    pub exit_code: Option<i64>,
    /// 创建时写入的标签
    pub labels: BTreeMap<String, String>,
}

impl ContainerState {
    /// 进程在运行且没有处于重启循环中
    pub fn is_healthy(&self) -> bool {
        self.running && !self.restarting
    }
}

/// 环境变量
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
    /// 是否为敏感变量（如包含 PASSWORD, SECRET, KEY 等）
    #[serde(default)]
    pub sensitive: bool,
}

impl EnvVar {
    /// 敏感关键词列表
    const SENSITIVE_KEYWORDS: &'static [&'static str] = &[
        "password", "secret", "key", "token", "credential", "auth",
        "api_key", "apikey", "private", "jwt", "pem", "cert",
    ];

    /// 检查变量名是否敏感
    pub fn is_sensitive_key(key: &str) -> bool {
        let key_lower = key.to_lowercase();
        Self::SENSITIVE_KEYWORDS.iter().any(|kw| key_lower.contains(kw))
    }

    /// 生成脱敏后的环境变量列表
    pub fn redacted(env: &BTreeMap<String, String>) -> Vec<EnvVar> {
        env.iter()
            .map(|(key, value)| {
                let sensitive = Self::is_sensitive_key(key);
                EnvVar {
                    key: key.clone(),
                    value: if sensitive {
                        "***REDACTED***".to_string()
                    } else {
                        value.clone()
                    },
                    sensitive,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_sensitive_key() {
        assert!(EnvVar::is_sensitive_key("POSTGRES_PASSWORD"));
        assert!(EnvVar::is_sensitive_key("api_key"));
        assert!(EnvVar::is_sensitive_key("TUNNEL_AUTHTOKEN"));
        assert!(!EnvVar::is_sensitive_key("PORT"));
    }

    #[test]
    fn test_redacted_hides_secrets_only() {
        let mut env = BTreeMap::new();
        env.insert("PORT".to_string(), "3000".to_string());
        env.insert("DB_PASSWORD".to_string(), "hunter2".to_string());

        let vars = EnvVar::redacted(&env);
        let password = vars.iter().find(|v| v.key == "DB_PASSWORD").unwrap();
        assert_eq!(password.value, "***REDACTED***");
        assert!(password.sensitive);
        let port = vars.iter().find(|v| v.key == "PORT").unwrap();
        assert_eq!(port.value, "3000");
    }

    #[test]
    fn test_publish_arg() {
        assert_eq!(PortBinding::new(31000, 3000).to_publish_arg(), "31000:3000");
    }
}
