//! 运行时状态模块
//!
//! 管理应用状态、部署记录和进度会话

pub mod app_state;
pub mod deployment_store;
pub mod session_registry;

pub use app_state::AppState;
pub use deployment_store::DeploymentStore;
pub use session_registry::SessionRegistry;
