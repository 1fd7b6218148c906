//! 部署阶段推进
//!
//! 只允许按 `DeployPhase::next()` 前进一步，同时记录每个阶段的耗时

use chrono::{DateTime, Utc};

use crate::domain::deploy::{DeployPhase, DeployStage};
use crate::error::DeployError;

/// 单个实例流水线的阶段状态
#[derive(Debug, Clone)]
pub struct PhaseTracker {
    phase: DeployPhase,
    failed: Option<DeployPhase>,
    label: Option<&'static str>,
    stages: Vec<DeployStage>,
    stage_started: DateTime<Utc>,
}

impl PhaseTracker {
    pub fn new(label: Option<&'static str>) -> Self {
        Self {
            phase: DeployPhase::Validating,
            failed: None,
            label,
            stages: Vec::new(),
            stage_started: Utc::now(),
        }
    }

    pub fn current(&self) -> DeployPhase {
        self.phase
    }

    pub fn stages(&self) -> &[DeployStage] {
        &self.stages
    }

    pub fn failed_stage(&self) -> Option<DeployPhase> {
        self.failed
    }

    /// 进入下一阶段；非法跳转返回 Internal
    pub fn advance(&mut self, to: DeployPhase) -> Result<(), DeployError> {
        if self.failed.is_some() {
            return Err(DeployError::internal(format!(
                "cannot enter {} after failure",
                to.as_str()
            )));
        }
        if self.phase.next() != Some(to) {
            return Err(DeployError::internal(format!(
                "illegal phase transition {} -> {}",
                self.phase.as_str(),
                to.as_str()
            )));
        }

        self.record(to, true, None);
        self.phase = to;
        Ok(())
    }

    /// 标记当前正在进入的阶段失败，返回该阶段
    pub fn fail(&mut self, message: &str) -> DeployPhase {
        if let Some(failed) = self.failed {
            return failed;
        }
        let failed = self.phase.next().unwrap_or(self.phase);
        self.record(failed, false, Some(message.to_string()));
        self.failed = Some(failed);
        failed
    }

    fn record(&mut self, phase: DeployPhase, success: bool, message: Option<String>) {
        let mut stage = DeployStage::start(phase, self.label);
        stage.started_at = self.stage_started;
        stage.finish(success, message);
        self.stage_started = Utc::now();
        self.stages.push(stage);
    }
}
