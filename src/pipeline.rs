//! Build Pipeline
//!
//! The CI job that produces packages and installer images, as data: an
//! ordered list of stages, each an argv with its own timeout. Stages run one
//! after another through the timeout guard and the run stops at the first
//! stage that does not succeed.

use crate::config::{PipelineConfig, StageConfig};
use crate::exec::{CommandRunner, WaitOutcome};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("unknown stage '{name}' (stages: {known})")]
    UnknownStage { name: String, known: String },

    #[error("pipeline has no stages")]
    Empty,
}

/// Result of one stage
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageReport {
    pub name: String,
    /// How the command ended; `None` when it could not be run at all
    pub outcome: Option<WaitOutcome>,
    /// Why the command could not be run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u128,
}

impl StageReport {
    pub fn success(&self) -> bool {
        self.outcome.is_some_and(|o| o.success())
    }
}

impl std::fmt::Display for StageReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.outcome, &self.error) {
            (Some(outcome), _) => write!(f, "{}: {} ({} ms)", self.name, outcome, self.duration_ms),
            (None, Some(err)) => write!(f, "{}: {}", self.name, err),
            (None, None) => write!(f, "{}: not run", self.name),
        }
    }
}

/// Stages that ran, in order
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineReport {
    pub stages: Vec<StageReport>,
}

impl PipelineReport {
    pub fn success(&self) -> bool {
        !self.stages.is_empty() && self.stages.iter().all(StageReport::success)
    }

    /// The stage that stopped the run, if any
    pub fn failed_stage(&self) -> Option<&StageReport> {
        self.stages.iter().find(|s| !s.success())
    }
}

pub struct Pipeline {
    runner: Arc<dyn CommandRunner>,
    stages: Vec<StageConfig>,
}

impl Pipeline {
    /// `runner` decides where the stages run; give it a guard with the
    /// pipeline working directory
    pub fn new(runner: Arc<dyn CommandRunner>, config: &PipelineConfig) -> Self {
        Self {
            runner,
            stages: config.stages.clone(),
        }
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    /// Stages from `from` (inclusive) to the end
    pub fn select(&self, from: Option<&str>) -> Result<&[StageConfig], PipelineError> {
        if self.stages.is_empty() {
            return Err(PipelineError::Empty);
        }
        let Some(name) = from else {
            return Ok(&self.stages);
        };
        let start = self
            .stages
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| PipelineError::UnknownStage {
                name: name.to_string(),
                known: self.stage_names().join(", "),
            })?;
        Ok(&self.stages[start..])
    }

    async fn run_stage(&self, stage: &StageConfig) -> StageReport {
        info!("Stage {}: starting (timeout {}s)", stage.name, stage.timeout_secs);
        let started = Instant::now();
        let result = self.runner.run_guarded(&stage.command, stage.timeout_secs).await;
        let duration_ms = started.elapsed().as_millis();

        let (outcome, error) = match result {
            Ok(outcome) => (Some(outcome), None),
            Err(e) => (None, Some(e.to_string())),
        };
        StageReport {
            name: stage.name.clone(),
            outcome,
            error,
            duration_ms,
        }
    }

    /// Run the pipeline, optionally resuming at stage `from`
    ///
    /// Unknown stage names are errors. Stage failures are not: they end the
    /// run and show up in the report.
    pub async fn run(&self, from: Option<&str>) -> Result<PipelineReport, PipelineError> {
        let stages = self.select(from)?;
        let mut report = PipelineReport::default();

        for stage in stages {
            let stage_report = self.run_stage(stage).await;
            let ok = stage_report.success();
            if ok {
                info!("{}", stage_report);
            } else {
                error!("{}", stage_report);
            }
            report.stages.push(stage_report);
            if !ok {
                break;
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::scripted::ScriptedRunner;

    fn pipeline(runner: &Arc<ScriptedRunner>) -> Pipeline {
        Pipeline::new(runner.clone(), &PipelineConfig::default())
    }

    #[tokio::test]
    async fn test_runs_all_stages_in_order() {
        let runner = Arc::new(ScriptedRunner::new());
        let report = pipeline(&runner).run(None).await.unwrap();

        assert!(report.success());
        assert_eq!(report.stages.len(), 3);
        assert_eq!(
            runner.calls(),
            vec!["git pull --ff-only", "make packages", "make release"]
        );
    }

    #[tokio::test]
    async fn test_stops_at_first_failure() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.guarded("make packages", WaitOutcome::TimedOut { escalated: true });

        let report = pipeline(&runner).run(None).await.unwrap();
        assert!(!report.success());
        assert_eq!(report.stages.len(), 2);
        let failed = report.failed_stage().unwrap();
        assert_eq!(failed.name, "packages");
        assert_eq!(failed.outcome, Some(WaitOutcome::TimedOut { escalated: true }));
        assert!(!runner.called("make release"));
    }

    #[tokio::test]
    async fn test_resume_from_stage() {
        let runner = Arc::new(ScriptedRunner::new());
        let report = pipeline(&runner).run(Some("release")).await.unwrap();

        assert_eq!(report.stages.len(), 1);
        assert_eq!(runner.calls(), vec!["make release"]);
    }

    #[tokio::test]
    async fn test_unknown_stage() {
        let runner = Arc::new(ScriptedRunner::new());
        let err = pipeline(&runner).run(Some("deploy")).await.unwrap_err();

        assert!(matches!(err, PipelineError::UnknownStage { ref name, .. } if name == "deploy"));
        assert!(err.to_string().contains("checkout, packages, release"));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_empty_pipeline() {
        let runner = Arc::new(ScriptedRunner::new());
        let config = PipelineConfig {
            stages: vec![],
            ..Default::default()
        };
        let err = Pipeline::new(runner, &config).run(None).await.unwrap_err();
        assert!(matches!(err, PipelineError::Empty));
    }

    #[test]
    fn test_stage_report_display() {
        let report = StageReport {
            name: "packages".to_string(),
            outcome: Some(WaitOutcome::Exited(2)),
            error: None,
            duration_ms: 15,
        };
        assert_eq!(report.to_string(), "packages: exited with status 2 (15 ms)");

        let report = StageReport {
            name: "checkout".to_string(),
            outcome: None,
            error: Some("no command given".to_string()),
            duration_ms: 0,
        };
        assert!(!report.success());
        assert_eq!(report.to_string(), "checkout: no command given");
    }
}
