//! 数据服务 + 管理界面的模板
//!
//! 模板中的占位符：`{password}` 生成的密码，`{address}` 公网 TCP 地址，
//! `{host}` / `{port}` 管理界面访问数据服务所用的主机与端口。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::error::DeployError;

/// 管理界面
#[derive(Debug, Clone)]
pub struct AdminUiProfile {
    pub image: String,
    pub port: u16,
    /// 镜像原本的启动命令
    pub command: String,
    pub env: Vec<(String, String)>,
}

/// 数据服务
#[derive(Debug, Clone)]
pub struct DataServiceProfile {
    pub engine: String,
    pub image: String,
    pub port: u16,
    pub command: String,
    pub env: Vec<(String, String)>,
    pub connection_url: String,
    pub admin: AdminUiProfile,
}

/// 生成的凭据与地址
#[derive(Debug, Clone)]
pub struct TemplateValues {
    pub password: String,
    pub address: String,
    pub host: String,
    pub port: u16,
}

/// 替换模板中的占位符
pub fn render_template(template: &str, values: &TemplateValues) -> String {
    template
        .replace("{password}", &values.password)
        .replace("{address}", &values.address)
        .replace("{host}", &values.host)
        .replace("{port}", &values.port.to_string())
}

fn render_env(env: &[(String, String)], values: &TemplateValues) -> BTreeMap<String, String> {
    env.iter()
        .map(|(key, value)| (key.clone(), render_template(value, values)))
        .collect()
}

impl DataServiceProfile {
    pub fn service_env(&self, values: &TemplateValues) -> BTreeMap<String, String> {
        render_env(&self.env, values)
    }

    pub fn service_command(&self, values: &TemplateValues) -> String {
        render_template(&self.command, values)
    }

    pub fn admin_env(&self, values: &TemplateValues) -> BTreeMap<String, String> {
        render_env(&self.admin.env, values)
    }

    pub fn connection_url(&self, values: &TemplateValues) -> String {
        render_template(&self.connection_url, values)
    }
}

/// 随机密码（字母数字）
pub fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect()
}

fn pairs(values: &[(&str, &str)]) -> Vec<(String, String)> {
    values
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// engine -> profile
pub struct DataServiceRegistry {
    profiles: HashMap<String, Arc<DataServiceProfile>>,
}

impl DataServiceRegistry {
    pub fn builtin() -> Self {
        let mut profiles = HashMap::new();

        let builtin = [
            DataServiceProfile {
                engine: "postgres".into(),
                image: "postgres:16-alpine".into(),
                port: 5432,
                command: "docker-entrypoint.sh postgres".into(),
                env: pairs(&[
                    ("POSTGRES_USER", "deployify"),
                    ("POSTGRES_PASSWORD", "{password}"),
                    ("POSTGRES_DB", "deployify"),
                ]),
                connection_url: "postgres://deployify:{password}@{address}/deployify".into(),
                admin: AdminUiProfile {
                    image: "adminer:4".into(),
                    port: 8080,
                    command: "entrypoint.sh php -S [::]:8080 -t /var/www/html".into(),
                    env: pairs(&[("ADMINER_DEFAULT_SERVER", "{host}:{port}")]),
                },
            },
            DataServiceProfile {
                engine: "mongodb".into(),
                image: "mongo:7".into(),
                port: 27017,
                command: "docker-entrypoint.sh mongod".into(),
                env: pairs(&[
                    ("MONGO_INITDB_ROOT_USERNAME", "deployify"),
                    ("MONGO_INITDB_ROOT_PASSWORD", "{password}"),
                ]),
                connection_url: "mongodb://deployify:{password}@{address}/?authSource=admin"
                    .into(),
                admin: AdminUiProfile {
                    image: "mongo-express:1".into(),
                    port: 8081,
                    command: "/docker-entrypoint.sh mongo-express".into(),
                    env: pairs(&[
                        (
                            "ME_CONFIG_MONGODB_URL",
                            "mongodb://deployify:{password}@{host}:{port}/?authSource=admin",
                        ),
                        ("ME_CONFIG_BASICAUTH", "false"),
                    ]),
                },
            },
            DataServiceProfile {
                engine: "redis".into(),
                image: "redis:7-alpine".into(),
                port: 6379,
                command: "docker-entrypoint.sh redis-server --requirepass {password}".into(),
                env: Vec::new(),
                connection_url: "redis://:{password}@{address}".into(),
                admin: AdminUiProfile {
                    image: "rediscommander/redis-commander:latest".into(),
                    port: 8081,
                    command: "/redis-commander/docker/entrypoint.sh".into(),
                    env: pairs(&[
                        ("REDIS_HOST", "{host}"),
                        ("REDIS_PORT", "{port}"),
                        ("REDIS_PASSWORD", "{password}"),
                    ]),
                },
            },
        ];

        for profile in builtin {
            profiles.insert(profile.engine.clone(), Arc::new(profile));
        }
        Self { profiles }
    }

    pub fn resolve(&self, engine: &str) -> Result<Arc<DataServiceProfile>, DeployError> {
        let key = match engine.trim().to_ascii_lowercase().as_str() {
            "postgresql" | "pg" => "postgres".to_string(),
            "mongo" => "mongodb".to_string(),
            other => other.to_string(),
        };
        self.profiles
            .get(&key)
            .cloned()
            .ok_or_else(|| DeployError::UnsupportedLanguage(engine.to_string()))
    }
}

impl Default for DataServiceRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
