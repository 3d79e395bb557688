//! Row types for the job registry.
//!
//! These mirror the registry tables: experiment groups, containers,
//! experiments, jobs, and the append-only job status history. Rows are
//! created through [`crate::registry::RegistryStore`] and are read-only
//! values everywhere else.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::{Entrypoint, JobMode};
use crate::experiment::{ArgTuple, ConfigValue};

/// Execution backend a job was submitted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Backend {
    /// The local container runtime.
    Local,
    /// The managed cloud training service.
    Cloud,
    /// The managed Kubernetes cluster.
    Cluster,
}

impl Backend {
    /// Stable uppercase name, used in the registry and display output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Local => "LOCAL",
            Backend::Cloud => "CLOUD",
            Backend::Cluster => "CLUSTER",
        }
    }

    /// Parses the stable name back into the enum.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LOCAL" => Some(Backend::Local),
            "CLOUD" => Some(Backend::Cloud),
            "CLUSTER" => Some(Backend::Cluster),
            _ => None,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Submitted,
    Running,
    Succeeded,
    Failed,
    Stopped,
    Unknown,
}

impl JobStatus {
    /// Terminal states never change again; the backend is not queried for
    /// jobs in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed | JobStatus::Stopped)
    }

    /// Whether the transition graph allows moving from `self` to `next`.
    ///
    /// Submitted moves to Running or straight to a terminal state; Running
    /// moves to a terminal state. Unknown is a wildcard: any non-terminal
    /// state may enter it when a backend query fails, and it may return to
    /// any state once a query succeeds. Re-observing the current state is
    /// always allowed.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        if *self == next {
            return true;
        }
        match self {
            JobStatus::Submitted | JobStatus::Running | JobStatus::Unknown => true,
            _ => false,
        }
    }

    /// Stable uppercase name, used in the registry and display output.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Submitted => "SUBMITTED",
            JobStatus::Running => "RUNNING",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
            JobStatus::Stopped => "STOPPED",
            JobStatus::Unknown => "UNKNOWN",
        }
    }

    /// Parses the stable name back into the enum.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SUBMITTED" => Some(JobStatus::Submitted),
            "RUNNING" => Some(JobStatus::Running),
            "SUCCEEDED" => Some(JobStatus::Succeeded),
            "FAILED" => Some(JobStatus::Failed),
            "STOPPED" => Some(JobStatus::Stopped),
            "UNKNOWN" => Some(JobStatus::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A named bucket tying related experiments together across submissions.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentGroup {
    pub id: i64,
    pub user: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl ExperimentGroup {
    /// Default group name: `<user>-xgroup-<yyyy-mm-dd-hh-mm-ss>`.
    pub fn generate_name(user: &str, at: DateTime<Utc>) -> String {
        format!("{}-xgroup-{}", user, at.format("%Y-%m-%d-%H-%M-%S"))
    }
}

/// The identity of a built image as recorded in the registry.
///
/// Immutable after creation; two invocations producing the same image
/// reference share one row.
#[derive(Debug, Clone, PartialEq)]
pub struct Container {
    pub id: i64,
    pub image_reference: String,
    pub mode: JobMode,
    pub build_context_path: String,
    pub extra_dirs: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// The identity of a run: a container, an entrypoint, and one argument
/// tuple. Executed many times as separate jobs.
#[derive(Debug, Clone, PartialEq)]
pub struct Experiment {
    pub id: i64,
    pub group_id: i64,
    pub container_id: i64,
    pub entrypoint: Entrypoint,
    pub args: Vec<String>,
    pub kwargs: Vec<(String, ConfigValue)>,
    pub created_at: DateTime<Utc>,
}

impl Experiment {
    /// Materializes the experiment's full argv: prefix args then expanded
    /// keyword bindings.
    pub fn to_args(&self) -> Vec<String> {
        ArgTuple { bindings: self.kwargs.clone() }.to_args(&self.args)
    }

    /// One-line command description for status output.
    pub fn command_string(&self) -> String {
        let mut parts = vec![self.entrypoint.target()];
        parts.extend(self.to_args());
        parts.join(" ")
    }
}

/// A single submission of an experiment to a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: i64,
    pub experiment_id: i64,
    pub backend: Backend,
    pub backend_handle: String,
    pub details: serde_json::Value,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
}

/// One entry of a job's append-only status history.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEvent {
    pub job_id: i64,
    pub status: JobStatus,
    pub observed_at: DateTime<Utc>,
    pub message: Option<String>,
}

/// Jobs in a group, organized experiment-by-experiment for display.
#[derive(Debug, Clone)]
pub struct GroupView {
    pub group: ExperimentGroup,
    pub containers: Vec<ContainerView>,
}

/// One container's experiments within a [`GroupView`].
#[derive(Debug, Clone)]
pub struct ContainerView {
    pub container: Container,
    pub experiments: Vec<ExperimentView>,
}

/// One experiment's jobs within a [`GroupView`], newest last.
#[derive(Debug, Clone)]
pub struct ExperimentView {
    pub experiment: Experiment,
    pub jobs: Vec<Job>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_generate_name_format() {
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 14, 9, 30).unwrap();
        assert_eq!(
            ExperimentGroup::generate_name("totoro", at),
            "totoro-xgroup-2024-03-05-14-09-30"
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Stopped.is_terminal());
        assert!(!JobStatus::Submitted.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Unknown.is_terminal());
    }

    #[test]
    fn test_transition_graph() {
        assert!(JobStatus::Submitted.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Submitted.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Succeeded));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Unknown));
        // Unknown may return to any known state.
        assert!(JobStatus::Unknown.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Unknown.can_transition_to(JobStatus::Stopped));
        // Terminal states only re-observe themselves.
        assert!(!JobStatus::Succeeded.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Unknown));
        assert!(JobStatus::Stopped.can_transition_to(JobStatus::Stopped));
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            JobStatus::Submitted,
            JobStatus::Running,
            JobStatus::Succeeded,
            JobStatus::Failed,
            JobStatus::Stopped,
            JobStatus::Unknown,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("nope"), None);
    }

    #[test]
    fn test_backend_round_trip() {
        for backend in [Backend::Local, Backend::Cloud, Backend::Cluster] {
            assert_eq!(Backend::parse(backend.as_str()), Some(backend));
        }
        assert_eq!(Backend::parse("CAIP"), None);
    }

    #[test]
    fn test_experiment_to_args() {
        let experiment = Experiment {
            id: 1,
            group_id: 1,
            container_id: 1,
            entrypoint: Entrypoint::PyModule { module: "trainer.main".to_string() },
            args: vec!["--base".to_string()],
            kwargs: vec![
                ("lr".to_string(), ConfigValue::Float(0.1)),
                ("cache".to_string(), ConfigValue::Bool(true)),
            ],
            created_at: Utc::now(),
        };
        assert_eq!(experiment.to_args(), vec!["--base", "--lr", "0.1", "--cache"]);
        assert_eq!(experiment.command_string(), "trainer.main --base --lr 0.1 --cache");
    }
}
