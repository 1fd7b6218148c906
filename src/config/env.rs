//! 环境变量配置加载

use std::env;
use std::ops::Range;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use self::constants::{
    DEFAULT_API_KEY, DEFAULT_BUILD_RETRIES, DEFAULT_PORT_RANGE_END, DEFAULT_PORT_RANGE_START,
    DEFAULT_START_SETTLE_MS, DEFAULT_STOP_GRACE_SECS,
};

/// 环境配置
#[derive(Clone, Debug)]
pub struct EnvConfig {
    /// API 密钥
    pub api_key: String,
    /// 服务监听端口
    pub port: u16,
    /// 实例主机端口的分配范围 [start, end)
    pub port_range: Range<u16>,
    /// 镜像构建配置
    pub build: BuildConfig,
    /// 实例生命周期配置
    pub instance: InstanceConfig,
    /// 隧道服务商配置
    pub tunnel: TunnelConfig,
}

/// 镜像构建配置
#[derive(Clone, Debug)]
pub struct BuildConfig {
    /// docker 可执行文件
    pub docker_bin: String,
    /// 构建上下文的根目录
    pub build_root: PathBuf,
    /// 构建失败后的额外重试次数
    pub max_retries: u32,
    /// 单次构建超时
    pub build_timeout: Duration,
    /// 在镜像中安装隧道 agent 的命令
    pub agent_install: String,
}

/// 实例生命周期配置
#[derive(Clone, Debug)]
pub struct InstanceConfig {
    /// docker stop 的宽限期
    pub stop_grace: Duration,
    /// 启动后检查运行状态前的固定等待
    pub start_settle: Duration,
}

/// 隧道服务商配置
#[derive(Clone, Debug)]
pub struct TunnelConfig {
    /// 控制面 API 地址
    pub api_url: String,
    /// 控制面 API 密钥
    pub api_key: String,
    /// 写入 agent 配置的认证令牌
    pub authtoken: String,
    /// 预留域名的后缀 (e.g., "ngrok.app")
    pub domain: String,
    /// 区域
    pub region: String,
}

impl EnvConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Self {
        let api_key = load_with_fallback("DEPLOYIFY_API_KEY", "API_KEY")
            .unwrap_or_else(|| DEFAULT_API_KEY.to_string());
        if api_key.is_empty() || api_key == DEFAULT_API_KEY {
            warn!("DEPLOYIFY_API_KEY is not set; deploy and removal requests will be refused");
        }
        if env::var("API_KEY").is_ok() && env::var("DEPLOYIFY_API_KEY").is_err() {
            warn!("Deprecated environment variable API_KEY detected. Please use DEPLOYIFY_API_KEY");
        }

        let port = env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8787);

        let port_range = env::var("DEPLOYIFY_PORT_RANGE")
            .ok()
            .and_then(|v| {
                let parsed = parse_port_range(&v);
                if parsed.is_none() {
                    warn!(value = %v, "Invalid DEPLOYIFY_PORT_RANGE, using default");
                }
                parsed
            })
            .unwrap_or(DEFAULT_PORT_RANGE_START..DEFAULT_PORT_RANGE_END);

        Self {
            api_key,
            port,
            port_range,
            build: BuildConfig::from_env(),
            instance: InstanceConfig::from_env(),
            tunnel: TunnelConfig::from_env(),
        }
    }
}

impl BuildConfig {
    pub fn from_env() -> Self {
        let docker_bin = env::var("DOCKER_BIN").unwrap_or_else(|_| "docker".to_string());

        let build_root = env::var("DEPLOYIFY_BUILD_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| env::temp_dir().join("deployify-builds"));

        let max_retries = env::var("DEPLOYIFY_BUILD_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_BUILD_RETRIES);

        let build_timeout = env::var("DEPLOYIFY_BUILD_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(constants::BUILD_TIMEOUT_SECS));

        let agent_install = env::var("TUNNEL_AGENT_INSTALL")
            .unwrap_or_else(|_| constants::DEFAULT_AGENT_INSTALL.to_string());

        Self {
            docker_bin,
            build_root,
            max_retries,
            build_timeout,
            agent_install,
        }
    }
}

impl InstanceConfig {
    pub fn from_env() -> Self {
        let stop_grace = env::var("DEPLOYIFY_STOP_GRACE_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_STOP_GRACE_SECS));

        let start_settle = env::var("DEPLOYIFY_START_SETTLE_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(DEFAULT_START_SETTLE_MS));

        Self {
            stop_grace,
            start_settle,
        }
    }
}

impl TunnelConfig {
    pub fn from_env() -> Self {
        let api_url = env::var("TUNNEL_API_URL")
            .unwrap_or_else(|_| "https://api.ngrok.com".to_string())
            .trim_end_matches('/')
            .to_string();

        let api_key = env::var("TUNNEL_API_KEY").unwrap_or_default();
        if api_key.is_empty() {
            warn!("TUNNEL_API_KEY is not set, endpoint reservations will fail");
        }

        let authtoken = env::var("TUNNEL_AUTHTOKEN").unwrap_or_default();
        let domain = env::var("TUNNEL_DOMAIN").unwrap_or_else(|_| "ngrok.app".to_string());
        let region = env::var("TUNNEL_REGION").unwrap_or_else(|_| "us".to_string());

        Self {
            api_url,
            api_key,
            authtoken,
            domain,
            region,
        }
    }
}

/// 解析 "30000-40000" 形式的端口范围（左闭右开）
pub fn parse_port_range(value: &str) -> Option<Range<u16>> {
    let (start, end) = value.trim().split_once('-')?;
    let start: u16 = start.trim().parse().ok()?;
    let end: u16 = end.trim().parse().ok()?;
    if start == 0 || start >= end {
        return None;
    }
    Some(start..end)
}

/// 加载环境变量，支持 fallback
fn load_with_fallback(primary: &str, fallback: &str) -> Option<String> {
    env::var(primary).ok().or_else(|| env::var(fallback).ok())
}

/// 常量
pub mod constants {
    /// 默认端口范围
    pub const DEFAULT_PORT_RANGE_START: u16 = 30000;
    pub const DEFAULT_PORT_RANGE_END: u16 = 40000;

    /// 构建失败后的默认重试次数
    pub const DEFAULT_BUILD_RETRIES: u32 = 2;

    /// 单次构建超时（秒）
    pub const BUILD_TIMEOUT_SECS: u64 = 900; // 15 分钟

    /// docker stop 宽限期（秒）
    pub const DEFAULT_STOP_GRACE_SECS: u64 = 10;

    /// 启动后等待（毫秒）
    pub const DEFAULT_START_SETTLE_MS: u64 = 2000;

    /// docker 短命令超时（秒）
    pub const DOCKER_COMMAND_TIMEOUT_SECS: u64 = 60;

    /// 镜像拉取超时（秒）
    pub const DOCKER_PULL_TIMEOUT_SECS: u64 = 600;

    /// 部署历史最大保存数量
    pub const MAX_DEPLOYMENT_HISTORY: usize = 200;

    /// 未配置时的占位 API Key，带着它的写请求一律拒绝
    pub const DEFAULT_API_KEY: &str = "change-me-in-production";

    /// 实例与镜像名前缀
    pub const NAME_PREFIX: &str = "deployify";

    /// 在镜像中安装隧道 agent 的默认命令
    pub const DEFAULT_AGENT_INSTALL: &str = "(command -v ngrok >/dev/null 2>&1) || \
        (command -v apk >/dev/null 2>&1 && apk add --no-cache curl socat) || \
        (apt-get update && apt-get install -y --no-install-recommends curl ca-certificates socat && rm -rf /var/lib/apt/lists/*); \
        curl -fsSL https://bin.equinox.io/c/bNyj1mQVY4c/ngrok-v3-stable-linux-amd64.tgz | tar xz -C /usr/local/bin";

    /// 版本号
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}
