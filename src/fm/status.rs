//! Status of supervised work, derived on every read from (liveness, log tail). Never persisted.

use crate::fm::config::MarkersConfig;
use serde::Serialize;

/// Lines of this form, if a child emits them, take precedence over marker scanning.
/// The last well-formed record in the tail wins.
pub const STATUS_RECORD_PREFIX: &str = "fleetmaster-status:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    NotStarted,
    /// Alive, data preparation not finished yet (phase A).
    Preparing,
    /// Alive, compute phase (phase B) or wrapping up.
    Running,
    Complete,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::NotStarted => "not started",
            JobStatus::Preparing => "preparing",
            JobStatus::Running => "running",
            JobStatus::Complete => "complete",
            JobStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Error)
    }

    /// Counts against the concurrency limit.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Preparing | JobStatus::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reported {
    Preparing,
    Running,
    Complete,
    Failed,
}

fn last_status_record(tail: &str) -> Option<Reported> {
    tail.lines().rev().find_map(|line| {
        let rest = line.trim().strip_prefix(STATUS_RECORD_PREFIX)?;
        match rest.trim() {
            "preparing" => Some(Reported::Preparing),
            "running" => Some(Reported::Running),
            "complete" => Some(Reported::Complete),
            "failed" => Some(Reported::Failed),
            _ => None,
        }
    })
}

/// Map (liveness, log tail) to a job status. Pure: same inputs, same answer.
///
/// | alive | tail                              | status      |
/// |-------|-----------------------------------|-------------|
/// | yes   | complete or compute marker        | Running     |
/// | yes   | neither                           | Preparing   |
/// | no    | complete marker                   | Complete    |
/// | no    | non-empty, no complete marker     | Error       |
/// | no    | missing or empty                  | NotStarted  |
pub fn infer_job_status(alive: bool, log_tail: Option<&str>, markers: &MarkersConfig) -> JobStatus {
    let tail = log_tail.unwrap_or("");
    if let Some(rec) = last_status_record(tail) {
        return match (alive, rec) {
            (true, Reported::Preparing) => JobStatus::Preparing,
            (true, _) => JobStatus::Running,
            (false, Reported::Complete) => JobStatus::Complete,
            (false, _) => JobStatus::Error,
        };
    }
    let complete = tail.contains(markers.complete.as_str());
    if alive {
        if complete || tail.contains(markers.compute_started.as_str()) {
            JobStatus::Running
        } else {
            JobStatus::Preparing
        }
    } else if complete {
        JobStatus::Complete
    } else if tail.trim().is_empty() {
        JobStatus::NotStarted
    } else {
        JobStatus::Error
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceStatus {
    Running,
    /// Enabled but no live process: the next watch tick restarts it.
    Down,
    Disabled,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Running => "running",
            InstanceStatus::Down => "down",
            InstanceStatus::Disabled => "disabled",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A disabled instance that is still alive reports `Running`: it is stopped only by an update command.
pub fn infer_instance_status(alive: bool, enabled: bool) -> InstanceStatus {
    match (alive, enabled) {
        (true, _) => InstanceStatus::Running,
        (false, true) => InstanceStatus::Down,
        (false, false) => InstanceStatus::Disabled,
    }
}
