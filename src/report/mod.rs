//! Run report

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Orchestrator states, in the order a successful run passes through them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Init,
    Building,
    UsageChecked,
    RuntimeBuilt,
    AppRunning,
    Verified,
    RuntimeAppRunning,
    RuntimeVerified,
    Done,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Building => "building",
            Phase::UsageChecked => "usage-checked",
            Phase::RuntimeBuilt => "runtime-built",
            Phase::AppRunning => "app-running",
            Phase::Verified => "verified",
            Phase::RuntimeAppRunning => "runtime-app-running",
            Phase::RuntimeVerified => "runtime-verified",
            Phase::Done => "done",
            Phase::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timing of one completed phase
#[derive(Debug, Clone, Serialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub duration_ms: u64,
}

/// Outcome of a verification run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub image: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Final state: `done` or `failed`
    pub state: Phase,
    /// Last phase that completed successfully
    pub last_completed: Phase,
    /// Phase that was running when the run failed
    pub failed_during: Option<Phase>,
    pub phases: Vec<PhaseRecord>,
    pub error: Option<String>,
    pub cleaned_up: bool,
    pub exit_code: i32,
}

impl RunReport {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            image: image.into(),
            started_at: Utc::now(),
            finished_at: None,
            state: Phase::Init,
            last_completed: Phase::Init,
            failed_during: None,
            phases: Vec::new(),
            error: None,
            cleaned_up: false,
            exit_code: 0,
        }
    }

    pub fn complete(&mut self, phase: Phase, duration_ms: u64) {
        self.last_completed = phase;
        self.state = phase;
        self.phases.push(PhaseRecord { phase, duration_ms });
    }

    pub fn fail(&mut self, during: Phase, error: &crate::error::VerifyError) {
        self.state = Phase::Failed;
        self.failed_during = Some(during);
        self.error = Some(error.to_string());
        self.exit_code = error.exit_code();
    }

    pub fn finish(&mut self) {
        if self.state != Phase::Failed {
            self.state = Phase::Done;
        }
        self.finished_at = Some(Utc::now());
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Write the report as pretty JSON
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize report")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report to {}", path.display()))
    }
}
