//! 部署相关领域模型

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::tunnel::TunnelEndpoint;

/// 上传的单个源文件（内容为 base64）
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SourceFile {
    /// 相对路径 (e.g., "server.js", "src/app.py")
    pub path: String,
    /// base64 编码的文件内容
    pub content: String,
}

/// 解码后的上传文件
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedFile {
    pub path: String,
    pub bytes: Vec<u8>,
}

impl DecodedFile {
    pub fn new(path: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            bytes: bytes.into(),
        }
    }

    /// 按 UTF-8 解释内容，二进制文件返回 None
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }

    /// 小写的扩展名
    pub fn extension(&self) -> Option<String> {
        std::path::Path::new(&self.path)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
    }
}

/// 部署请求
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    /// 部署名称（全局唯一）
    pub name: String,
    /// 语言标签 (e.g., "nodejs", "python")
    pub language: String,
    /// 源文件，保持上传顺序
    #[serde(default)]
    pub files: Vec<SourceFile>,
    /// 覆盖默认启动命令
    #[serde(default)]
    pub run_command: Option<String>,
    /// 进度会话 ID
    #[serde(default)]
    pub session_id: Option<String>,
    /// 额外的实例环境变量
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// 部署成功响应
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeployResponse {
    pub url: String,
    pub internal_port: u16,
    pub exposed_port: u16,
    pub deployment_id: String,
}

/// 数据服务 + 管理界面（双实例）部署请求
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataServiceRequest {
    pub name: String,
    /// 数据服务引擎 (e.g., "postgres", "mongodb", "redis")
    pub engine: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// 双实例部署成功响应
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataServiceResponse {
    /// 数据服务的公网 TCP 地址 (tcp://host:port)
    pub connection_url: String,
    /// 管理界面的公网 URL
    pub admin_url: String,
    pub data_port: u16,
    pub admin_port: u16,
    pub deployment_id: String,
}

/// 部署流水线阶段
///
/// 严格按顺序推进，不允许回退或跳过
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeployPhase {
    Validating,
    NameChecked,
    PortAllocated,
    EndpointReserved,
    ContextMaterialized,
    ImageBuilt,
    InstanceStarted,
    Succeeded,
}

impl DeployPhase {
    /// 唯一合法的后继阶段
    pub fn next(self) -> Option<DeployPhase> {
        match self {
            DeployPhase::Validating => Some(DeployPhase::NameChecked),
            DeployPhase::NameChecked => Some(DeployPhase::PortAllocated),
            DeployPhase::PortAllocated => Some(DeployPhase::EndpointReserved),
            DeployPhase::EndpointReserved => Some(DeployPhase::ContextMaterialized),
            DeployPhase::ContextMaterialized => Some(DeployPhase::ImageBuilt),
            DeployPhase::ImageBuilt => Some(DeployPhase::InstanceStarted),
            DeployPhase::InstanceStarted => Some(DeployPhase::Succeeded),
            DeployPhase::Succeeded => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeployPhase::Validating => "validating",
            DeployPhase::NameChecked => "name_checked",
            DeployPhase::PortAllocated => "port_allocated",
            DeployPhase::EndpointReserved => "endpoint_reserved",
            DeployPhase::ContextMaterialized => "context_materialized",
            DeployPhase::ImageBuilt => "image_built",
            DeployPhase::InstanceStarted => "instance_started",
            DeployPhase::Succeeded => "succeeded",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            DeployPhase::Validating => "Validate Request",
            DeployPhase::NameChecked => "Check Name",
            DeployPhase::PortAllocated => "Allocate Port",
            DeployPhase::EndpointReserved => "Reserve Endpoint",
            DeployPhase::ContextMaterialized => "Write Build Context",
            DeployPhase::ImageBuilt => "Build Image",
            DeployPhase::InstanceStarted => "Start Instance",
            DeployPhase::Succeeded => "Done",
        }
    }

    /// 单实例流水线中到达该阶段时上报的进度百分比
    pub fn percentage(&self) -> u8 {
        match self {
            DeployPhase::Validating => 0,
            DeployPhase::NameChecked => 5,
            DeployPhase::PortAllocated => 15,
            DeployPhase::EndpointReserved => 25,
            DeployPhase::ContextMaterialized => 35,
            DeployPhase::ImageBuilt => 75,
            DeployPhase::InstanceStarted => 90,
            DeployPhase::Succeeded => 100,
        }
    }
}

/// 部署状态
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DeployStatus {
    Running,
    Succeeded,
    Failed,
    /// 已被 teardown 移除
    Removed,
}

impl DeployStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployStatus::Running => "running",
            DeployStatus::Succeeded => "succeeded",
            DeployStatus::Failed => "failed",
            DeployStatus::Removed => "removed",
        }
    }

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeployStatus::Running)
    }
}

/// 阶段状态
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Running,
    Success,
    Failed,
}

/// 部署阶段信息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeployStage {
    /// 阶段标识 (e.g., "port_allocated")
    pub name: String,
    /// 显示名称 (e.g., "Allocate Port")
    pub display_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// 持续时间（毫秒）
    pub duration_ms: Option<i64>,
    pub status: StageStatus,
    pub message: Option<String>,
}

impl DeployStage {
    /// 开始一个阶段
    pub fn start(phase: DeployPhase, label: Option<&str>) -> Self {
        let display_name = match label {
            Some(label) => format!("{} ({})", phase.display_name(), label),
            None => phase.display_name().to_string(),
        };
        Self {
            name: phase.as_str().to_string(),
            display_name,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
            status: StageStatus::Running,
            message: None,
        }
    }

    /// 完成阶段
    pub fn finish(&mut self, success: bool, message: Option<String>) {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.status = if success {
            StageStatus::Success
        } else {
            StageStatus::Failed
        };
        self.message = message;
        self.duration_ms = Some((now - self.started_at).num_milliseconds());
    }
}

/// 部署种类
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentKind {
    /// 上传源码构建的单实例应用
    App,
    /// 数据服务 + 管理界面
    DataService,
}

/// 部署记录
#[derive(Clone, Debug, Serialize)]
pub struct DeploymentRecord {
    pub id: String,
    pub name: String,
    pub kind: DeploymentKind,
    pub status: DeployStatus,
    /// 最后到达的阶段
    pub phase: DeployPhase,
    /// 失败时所在的阶段
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<DeployPhase>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub stages: Vec<DeployStage>,
    /// 创建的实例名称
    pub instances: Vec<String>,
    /// 构建的镜像 tag
    pub images: Vec<String>,
    /// 预留的公网端点
    pub endpoints: Vec<TunnelEndpoint>,
}

impl DeploymentRecord {
    pub fn new(id: String, name: String, kind: DeploymentKind) -> Self {
        Self {
            id,
            name,
            kind,
            status: DeployStatus::Running,
            phase: DeployPhase::Validating,
            failed_stage: None,
            started_at: Utc::now(),
            finished_at: None,
            url: None,
            error: None,
            stages: Vec::new(),
            instances: Vec::new(),
            images: Vec::new(),
            endpoints: Vec::new(),
        }
    }
}

/// 日志行（镜像构建输出）
#[derive(Clone, Debug, Serialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: String, // stdout | stderr
    pub content: String,
}

impl LogLine {
    pub fn new(stream: &str, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream: stream.to_string(),
            content: content.into(),
        }
    }

    pub fn stdout(content: impl Into<String>) -> Self {
        Self::new("stdout", content)
    }

    pub fn stderr(content: impl Into<String>) -> Self {
        Self::new("stderr", content)
    }
}
