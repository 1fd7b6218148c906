//! 基础设施模块
//!
//! 封装外部依赖（容器运行时、隧道控制面、命令执行）

pub mod command;
pub mod docker;
pub mod runtime;
pub mod tunnel_api;

pub use command::CommandRunner;
pub use docker::DockerCli;
pub use runtime::{ContainerRuntime, RuntimeError};
pub use tunnel_api::{TunnelApiClient, TunnelApiError, TunnelControlPlane};
