//! 服务层模块
//!
//! 包含核心业务逻辑：构建配置、端口分配、隧道端点、镜像与实例生命周期、部署编排

pub mod allocator;
pub mod data_profiles;
pub mod deploy;
pub mod image;
pub mod instance;
pub mod profiles;
pub mod progress;
pub mod tunnel;

pub use deploy::DeploymentOrchestrator;
