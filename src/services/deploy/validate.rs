//! 请求校验
//!
//! 全部在触碰外部资源之前完成

use std::collections::{BTreeMap, HashSet};
use std::path::{Component, Path};

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::domain::deploy::{DecodedFile, SourceFile};
use crate::error::DeployError;

use super::artifacts::GENERATED_FILES;

/// 部署名称最大长度（加上前缀与 `-admin` 后缀仍是合法的 DNS label）
pub const MAX_NAME_LEN: usize = 40;

/// 名称：小写字母、数字、连字符，首尾为字母数字
pub fn validate_name(name: &str) -> Result<(), DeployError> {
    if name.is_empty() {
        return Err(DeployError::validation("name is required"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(DeployError::validation(format!(
            "name must be at most {} characters",
            MAX_NAME_LEN
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(DeployError::validation(
            "name may only contain lowercase letters, digits and '-'",
        ));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(DeployError::validation(
            "name must start and end with a letter or digit",
        ));
    }
    Ok(())
}

/// 上传路径必须是相对路径，且不能跳出构建目录
fn validate_path(path: &str) -> Result<(), DeployError> {
    let invalid = |reason: &str| DeployError::validation(format!("file '{}': {}", path, reason));

    if path.trim().is_empty() {
        return Err(invalid("path is empty"));
    }
    if path.contains('\\') || path.contains('\0') {
        return Err(invalid("path contains an illegal character"));
    }

    let mut normal = 0;
    for component in Path::new(path).components() {
        match component {
            Component::Normal(_) => normal += 1,
            Component::CurDir => {}
            Component::ParentDir => return Err(invalid("path must not contain '..'")),
            Component::RootDir | Component::Prefix(_) => {
                return Err(invalid("path must be relative"))
            }
        }
    }
    if normal == 0 {
        return Err(invalid("path does not name a file"));
    }
    if GENERATED_FILES.contains(&path.trim_start_matches("./")) {
        return Err(invalid("name is reserved for a generated file"));
    }
    Ok(())
}

/// 校验并解码上传文件，保持上传顺序
pub fn decode_files(files: &[SourceFile]) -> Result<Vec<DecodedFile>, DeployError> {
    if files.is_empty() {
        return Err(DeployError::validation("at least one file is required"));
    }

    let mut seen = HashSet::new();
    let mut decoded = Vec::with_capacity(files.len());
    for file in files {
        validate_path(&file.path)?;
        let normalized = file.path.trim_start_matches("./").to_string();
        if !seen.insert(normalized.clone()) {
            return Err(DeployError::validation(format!(
                "file '{}' appears more than once",
                file.path
            )));
        }

        let compact: String = file.content.split_whitespace().collect();
        let bytes = STANDARD.decode(compact.as_bytes()).map_err(|e| {
            DeployError::validation(format!("file '{}': invalid base64 content: {}", file.path, e))
        })?;
        decoded.push(DecodedFile::new(normalized, bytes));
    }
    Ok(decoded)
}

/// 环境变量名：`[A-Za-z_][A-Za-z0-9_]*`
pub fn validate_env(env: &BTreeMap<String, String>) -> Result<(), DeployError> {
    for key in env.keys() {
        let mut chars = key.chars();
        let valid = chars
            .next()
            .map_or(false, |c| c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(DeployError::validation(format!(
                "invalid environment variable name '{}'",
                key
            )));
        }
    }
    Ok(())
}
