//! 命令执行器
//!
//! 提供统一的外部命令执行接口，支持：
//! - 实时日志流式输出（镜像构建）
//! - 超时控制
//! - 取消支持（进程关闭时终止构建）
//! - 非零退出码转为错误

use std::ffi::OsStr;
use std::path::Path;
use std::process::{ExitStatus, Output, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::domain::deploy::LogLine;

/// 命令执行器
pub struct CommandRunner;

/// 命令执行错误
#[derive(Debug, Error)]
pub enum CommandError {
    /// 命令启动失败
    #[error("failed to spawn `{program}`: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },
    /// 命令超时
    #[error("`{program}` timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },
    /// 命令被取消
    #[error("`{program}` was cancelled")]
    Cancelled { program: String },
    /// 等待命令完成失败
    #[error("failed to wait for `{program}`: {source}")]
    WaitFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },
    /// 非零退出
    #[error("`{program}` exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
}

/// 流式命令执行结果
pub struct CommandResult {
    /// 退出状态
    pub status: ExitStatus,
    /// 最后若干行 stderr，用于错误信息
    pub stderr_tail: Vec<String>,
}

/// 保留的 stderr 尾部行数
const STDERR_TAIL_LINES: usize = 20;

impl CommandRunner {
    /// 执行命令并把 stdout/stderr 逐行推送到日志通道
    ///
    /// 超时或取消时会杀掉子进程
    pub async fn run_with_streaming(
        program: &str,
        args: &[&str],
        work_dir: &Path,
        log_tx: broadcast::Sender<LogLine>,
        cancel: CancellationToken,
        timeout: Duration,
    ) -> Result<CommandResult, CommandError> {
        debug!(program = %program, ?args, "Spawning streamed command");

        let mut child = Command::new(program)
            .args(args)
            .current_dir(work_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CommandError::SpawnFailed {
                program: program.to_string(),
                source,
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stdout_tx = log_tx.clone();
        let stdout_task = tokio::spawn(async move {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = stdout_tx.send(LogLine::stdout(line));
                }
            }
        });

        // docker build 的进度输出走 stderr，同时保留尾部用于报错
        let stderr_tx = log_tx;
        let stderr_task = tokio::spawn(async move {
            let mut tail = std::collections::VecDeque::with_capacity(STDERR_TAIL_LINES);
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line.clone());
                    let _ = stderr_tx.send(LogLine::stderr(line));
                }
            }
            tail.into_iter().collect::<Vec<_>>()
        });

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                warn!(program = %program, "Command cancelled, killing process");
                let _ = child.kill().await;
                Err(CommandError::Cancelled { program: program.to_string() })
            }
            _ = tokio::time::sleep(timeout) => {
                error!(program = %program, "Command timed out after {:?}", timeout);
                let _ = child.kill().await;
                Err(CommandError::Timeout { program: program.to_string(), timeout })
            }
            status = child.wait() => {
                status.map_err(|source| CommandError::WaitFailed {
                    program: program.to_string(),
                    source,
                })
            }
        };

        let _ = stdout_task.await;
        let stderr_tail = stderr_task.await.unwrap_or_default();

        result.map(|status| CommandResult {
            status,
            stderr_tail,
        })
    }

    /// 执行简单命令（无流式输出）
    pub async fn run_simple<I, S>(
        program: &str,
        args: I,
        timeout: Duration,
    ) -> Result<Output, CommandError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        tokio::select! {
            result = child => {
                result.map_err(|source| CommandError::SpawnFailed {
                    program: program.to_string(),
                    source,
                })
            }
            _ = tokio::time::sleep(timeout) => {
                Err(CommandError::Timeout { program: program.to_string(), timeout })
            }
        }
    }

    /// 执行命令，非零退出码视为错误，成功时返回 stdout
    pub async fn run_checked<I, S>(
        program: &str,
        args: I,
        timeout: Duration,
    ) -> Result<String, CommandError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = Self::run_simple(program, args, timeout).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(CommandError::Failed {
                program: program.to_string(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}
