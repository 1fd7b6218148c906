//! 构建上下文
//!
//! 每次构建一个独立目录 `{build_root}/{instance}-{uuid}`，
//! 包含解码后的上传文件和生成的 Dockerfile / 启动脚本 / agent 配置。

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::deploy::DecodedFile;
use crate::error::DeployError;

use super::artifacts::{AGENT_CONFIG, DOCKERFILE, START_SCRIPT};

/// 写入上下文目录的生成文件
#[derive(Debug, Clone)]
pub struct GeneratedArtifacts {
    pub dockerfile: String,
    pub start_script: String,
    pub agent_config: String,
}

/// 本次构建使用的目录（尚未创建）
pub fn context_dir(build_root: &Path, instance: &str) -> PathBuf {
    build_root.join(format!("{}-{}", instance, Uuid::new_v4()))
}

/// 写入上下文目录
pub async fn materialize(
    dir: &Path,
    files: &[DecodedFile],
    artifacts: &GeneratedArtifacts,
) -> Result<(), DeployError> {
    write_all(dir, files, artifacts).await.map_err(|e| {
        DeployError::internal(format!(
            "write build context {}: {}",
            dir.display(),
            e
        ))
    })
}

async fn write_all(
    dir: &Path,
    files: &[DecodedFile],
    artifacts: &GeneratedArtifacts,
) -> io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;

    for file in files {
        let target = dir.join(&file.path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, &file.bytes).await?;
    }

    tokio::fs::write(dir.join(DOCKERFILE), &artifacts.dockerfile).await?;
    tokio::fs::write(dir.join(START_SCRIPT), &artifacts.start_script).await?;
    tokio::fs::write(dir.join(AGENT_CONFIG), &artifacts.agent_config).await?;

    debug!(dir = %dir.display(), files = files.len(), "Build context written");
    Ok(())
}

/// 删除上下文目录，目录不存在不算错误
pub async fn discard(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!(dir = %dir.display(), "Build context removed"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(dir = %dir.display(), error = %e, "Failed to remove build context"),
    }
}
