//! 领域模型模块
//!
//! 纯数据结构，不依赖 axum/tokio

pub mod container;
pub mod deploy;
pub mod progress;
pub mod tunnel;

// Re-exports for convenience
pub use container::{ContainerState, EnvVar, InstanceRecord, InstanceSpec, PortBinding};
pub use deploy::{
    DataServiceRequest, DataServiceResponse, DecodedFile, DeployPhase, DeployRequest, DeployResponse,
    DeployStage, DeployStatus, DeploymentKind, DeploymentRecord, LogLine, SourceFile,
    StageStatus,
};
pub use progress::ProgressEvent;
pub use tunnel::{TunnelEndpoint, TunnelKind};
