//! Read-side services over the registry: grouped status views, stop, and
//! resubmit.
//!
//! Status queries refresh non-terminal jobs through the owning backend
//! adapter before rendering, so the registry converges on the backend's
//! view of the world. Stop and resubmit drive the same adapters.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::{BackendAdapter, JobSpec, StopOutcome};
use crate::dispatch::submit_tuple;
use crate::error::{CalibanError, Result};
use crate::registry::{Backend, Experiment, GroupView, Job, JobStatus, RegistryStore};

/// The adapters available to status operations, one slot per backend.
/// Slots may be empty when a backend is not configured; its jobs are then
/// reported from the registry without a live refresh.
#[derive(Default)]
pub struct AdapterSet {
    pub local: Option<Box<dyn BackendAdapter>>,
    pub cloud: Option<Box<dyn BackendAdapter>>,
    pub cluster: Option<Box<dyn BackendAdapter>>,
}

impl AdapterSet {
    pub fn get(&self, backend: Backend) -> Option<&dyn BackendAdapter> {
        match backend {
            Backend::Local => self.local.as_deref(),
            Backend::Cloud => self.cloud.as_deref(),
            Backend::Cluster => self.cluster.as_deref(),
        }
    }
}

/// Refreshes one job's status from its backend. Terminal jobs are left
/// alone; a failed query places the job in Unknown.
pub async fn refresh_job(
    store: &mut RegistryStore,
    adapters: &AdapterSet,
    job: &Job,
) -> Result<Job> {
    if job.status.is_terminal() {
        return Ok(job.clone());
    }
    let adapter = match adapters.get(job.backend) {
        Some(adapter) => adapter,
        None => return Ok(job.clone()),
    };

    match adapter.query(&job.backend_handle).await {
        Ok(status) => Ok(store.update_job_status(job.id, status, None)?),
        Err(e) => {
            warn!(job = job.id, error = %e, "status query failed");
            Ok(store.update_job_status(
                job.id,
                JobStatus::Unknown,
                Some(&format!("query failed: {}", e)),
            )?)
        }
    }
}

/// The most recent `limit` jobs across all groups, refreshed and organized
/// group -> container -> experiment.
pub async fn recent(
    store: &mut RegistryStore,
    adapters: &AdapterSet,
    limit: usize,
) -> Result<Vec<GroupView>> {
    let jobs = store.list_recent_jobs(limit)?;
    let mut refreshed = Vec::with_capacity(jobs.len());
    for job in &jobs {
        refreshed.push(refresh_job(store, adapters, job).await?);
    }
    Ok(store.grouped_views_for_jobs(&refreshed)?)
}

/// A group's jobs, refreshed, with at most `max_per_experiment` jobs shown
/// per experiment.
pub async fn group(
    store: &mut RegistryStore,
    adapters: &AdapterSet,
    name: &str,
    max_per_experiment: Option<usize>,
) -> Result<Option<GroupView>> {
    let group = match store.find_group(name)? {
        Some(group) => group,
        None => return Ok(None),
    };
    for job in store.jobs_in_group(&group)? {
        refresh_job(store, adapters, &job).await?;
    }
    Ok(Some(store.group_view(&group, max_per_experiment)?))
}

/// Outcome of a stop request across a group.
#[derive(Debug, Default)]
pub struct StopReport {
    /// Jobs whose backends acknowledged the stop request.
    pub requested: Vec<Job>,
    /// Jobs already terminal or unknown to their backend; left untouched.
    pub no_change: Vec<Job>,
}

/// Stops every submitted or running job in a group.
///
/// With `dry_run` the candidates are reported and nothing is touched. A job
/// already in a terminal state is a no-op reported in `no_change`. The
/// status rows keep their current state with a "stop requested" history
/// entry; the terminal observation arrives on a later refresh once the
/// backend settles.
pub async fn stop(
    store: &mut RegistryStore,
    adapters: &AdapterSet,
    group_name: &str,
    dry_run: bool,
) -> Result<StopReport> {
    let group = store
        .find_group(group_name)?
        .ok_or_else(|| {
            CalibanError::Registry(crate::registry::RegistryError::NotFound(format!(
                "experiment group '{}'",
                group_name
            )))
        })?;

    let mut report = StopReport::default();
    let candidates = store.jobs_in_group_matching(&group, |s| {
        matches!(s, JobStatus::Submitted | JobStatus::Running)
    })?;

    if dry_run {
        info!("{} jobs would be stopped", candidates.len());
        report.requested = candidates;
        return Ok(report);
    }

    for job in candidates {
        let adapter = match adapters.get(job.backend) {
            Some(adapter) => adapter,
            None => {
                report.no_change.push(job);
                continue;
            }
        };
        match adapter.stop(&job.backend_handle).await {
            Ok(StopOutcome::Requested) => {
                let updated =
                    store.update_job_status(job.id, job.status, Some("stop requested"))?;
                info!(job = job.id, handle = %job.backend_handle, "stop requested");
                report.requested.push(updated);
            }
            Ok(StopOutcome::NotStoppable) => {
                report.no_change.push(job);
            }
            Err(e) => {
                warn!(job = job.id, error = %e, "stop failed");
                report.no_change.push(job);
            }
        }
    }

    // Jobs that were already terminal never make it into the candidate
    // list; surface them as explicit no-ops for the caller's report.
    let terminal = store.jobs_in_group_matching(&group, |s| s.is_terminal())?;
    report.no_change.extend(terminal);

    Ok(report)
}

/// Outcome of resubmitting one experiment.
#[derive(Debug)]
pub struct ResubmitOutcome {
    pub experiment: Experiment,
    pub job: Option<Job>,
    pub error: Option<String>,
}

/// Report of a group resubmission.
#[derive(Debug, Default)]
pub struct ResubmitReport {
    pub outcomes: Vec<ResubmitOutcome>,
}

impl ResubmitReport {
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.error.is_none())
    }
}

/// Resubmits experiments in a group.
///
/// By default only experiments whose latest job is Failed or Stopped are
/// selected; `all_jobs` widens that to every experiment with at least one
/// job. When `rebuilt_image` is set (the caller rebuilt the container so
/// code changes are captured), submissions run against the new image;
/// otherwise the experiment's recorded container image is reused.
pub async fn resubmit(
    store: &mut RegistryStore,
    adapters: &AdapterSet,
    group_name: &str,
    dry_run: bool,
    all_jobs: bool,
    rebuilt_image: Option<String>,
    cancel: &CancellationToken,
) -> Result<ResubmitReport> {
    let group = store
        .find_group(group_name)?
        .ok_or_else(|| {
            CalibanError::Registry(crate::registry::RegistryError::NotFound(format!(
                "experiment group '{}'",
                group_name
            )))
        })?;

    let mut selected: Vec<(Experiment, Job)> = Vec::new();
    for experiment in store.experiments_in_group(&group)? {
        let latest = match store.latest_job_for_experiment(experiment.id)? {
            Some(job) => job,
            None => continue,
        };
        let wants = all_jobs
            || matches!(latest.status, JobStatus::Failed | JobStatus::Stopped);
        if wants {
            selected.push((experiment, latest));
        }
    }

    let mut report = ResubmitReport::default();

    if dry_run {
        for (experiment, _) in selected {
            info!(
                experiment = experiment.id,
                "would resubmit: {}",
                experiment.command_string()
            );
            report.outcomes.push(ResubmitOutcome { experiment, job: None, error: None });
        }
        return Ok(report);
    }

    for (index, (experiment, latest)) in selected.into_iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(CalibanError::Cancelled);
        }

        let adapter = match adapters.get(latest.backend) {
            Some(adapter) => adapter,
            None => {
                report.outcomes.push(ResubmitOutcome {
                    experiment,
                    job: None,
                    error: Some(format!("no adapter configured for {}", latest.backend)),
                });
                continue;
            }
        };

        let container = store.get_container(experiment.container_id)?;
        let image =
            rebuilt_image.clone().unwrap_or_else(|| container.image_reference.clone());

        let mut spec = JobSpec::new(
            &image,
            experiment.entrypoint.clone(),
            experiment.to_args(),
            container.mode,
        );
        spec.index = index + 1;
        spec.job_name = Some(group.name.clone());

        match submit_tuple(store, adapter, &experiment, spec, cancel).await {
            Ok(job) => {
                info!(experiment = experiment.id, job = job.id, "resubmitted");
                report.outcomes.push(ResubmitOutcome { experiment, job: Some(job), error: None });
            }
            Err(crate::backend::BackendError::Cancelled) => {
                return Err(CalibanError::Cancelled)
            }
            Err(e) => {
                warn!(experiment = experiment.id, error = %e, "resubmission failed");
                report.outcomes.push(ResubmitOutcome {
                    experiment,
                    job: None,
                    error: Some(e.to_string()),
                });
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, BackendResult, SubmitResult};
    use crate::config::{Entrypoint, JobMode};
    use crate::experiment::ConfigValue;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Adapter whose query always answers with a fixed status and whose
    /// stop requests are recorded.
    struct ScriptedAdapter {
        backend: Backend,
        query_status: BackendResult<JobStatus>,
        stops: Mutex<Vec<String>>,
        submissions: AtomicUsize,
    }

    impl ScriptedAdapter {
        fn cloud(status: JobStatus) -> Self {
            Self {
                backend: Backend::Cloud,
                query_status: Ok(status),
                stops: Mutex::new(Vec::new()),
                submissions: AtomicUsize::new(0),
            }
        }

        fn failing_query() -> Self {
            Self {
                backend: Backend::Cloud,
                query_status: Err(BackendError::Transient("timeout".to_string())),
                stops: Mutex::new(Vec::new()),
                submissions: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl BackendAdapter for ScriptedAdapter {
        fn backend(&self) -> Backend {
            self.backend
        }

        fn validate(&self, _spec: &JobSpec) -> BackendResult<()> {
            Ok(())
        }

        async fn submit(
            &self,
            spec: &JobSpec,
            _cancel: &CancellationToken,
        ) -> BackendResult<SubmitResult> {
            let n = self.submissions.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(SubmitResult {
                backend_handle: format!("resubmit-{}", n),
                details: serde_json::json!({"image": spec.image}),
            })
        }

        async fn query(&self, _handle: &str) -> BackendResult<JobStatus> {
            match &self.query_status {
                Ok(status) => Ok(*status),
                Err(_) => Err(BackendError::Transient("timeout".to_string())),
            }
        }

        async fn stop(&self, handle: &str) -> BackendResult<StopOutcome> {
            self.stops.lock().unwrap().push(handle.to_string());
            Ok(StopOutcome::Requested)
        }
    }

    fn adapters(adapter: ScriptedAdapter) -> AdapterSet {
        AdapterSet { cloud: Some(Box::new(adapter)), ..Default::default() }
    }

    fn seed(store: &mut RegistryStore, kwarg: f64) -> (crate::registry::ExperimentGroup, Job) {
        let group = store.get_or_create_group(Some("g")).unwrap();
        let container = store
            .get_or_create_container("sha256:abc", JobMode::Cpu, Path::new("/p"), &[])
            .unwrap();
        let experiment = store
            .get_or_create_experiment(
                &group,
                &container,
                &Entrypoint::PyModule { module: "m".to_string() },
                &[],
                &[("lr".to_string(), ConfigValue::Float(kwarg))],
            )
            .unwrap();
        let job = store
            .create_job(&experiment, Backend::Cloud, &format!("h-{}", kwarg), &serde_json::json!({}))
            .unwrap();
        (group, job)
    }

    #[tokio::test]
    async fn test_refresh_updates_nonterminal_jobs() {
        let mut store = RegistryStore::open_in_memory().unwrap();
        let (_, job) = seed(&mut store, 0.1);
        let set = adapters(ScriptedAdapter::cloud(JobStatus::Running));

        let refreshed = refresh_job(&mut store, &set, &job).await.unwrap();
        assert_eq!(refreshed.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_refresh_failure_moves_to_unknown() {
        let mut store = RegistryStore::open_in_memory().unwrap();
        let (_, job) = seed(&mut store, 0.1);
        let set = adapters(ScriptedAdapter::failing_query());

        let refreshed = refresh_job(&mut store, &set, &job).await.unwrap();
        assert_eq!(refreshed.status, JobStatus::Unknown);
    }

    #[tokio::test]
    async fn test_refresh_skips_terminal_jobs() {
        let mut store = RegistryStore::open_in_memory().unwrap();
        let (_, job) = seed(&mut store, 0.1);
        store.update_job_status(job.id, JobStatus::Succeeded, None).unwrap();
        let job = store.get_job(job.id).unwrap();

        // The adapter would answer Running, but terminal rows are final.
        let set = adapters(ScriptedAdapter::cloud(JobStatus::Running));
        let refreshed = refresh_job(&mut store, &set, &job).await.unwrap();
        assert_eq!(refreshed.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_recent_groups_jobs() {
        let mut store = RegistryStore::open_in_memory().unwrap();
        seed(&mut store, 0.1);
        seed(&mut store, 0.2);
        let set = adapters(ScriptedAdapter::cloud(JobStatus::Running));

        let views = recent(&mut store, &set, 10).await.unwrap();
        assert_eq!(views.len(), 1);
        let experiments: usize = views[0].containers.iter().map(|c| c.experiments.len()).sum();
        assert_eq!(experiments, 2);
    }

    #[tokio::test]
    async fn test_stop_requests_only_live_jobs() {
        let mut store = RegistryStore::open_in_memory().unwrap();
        let (_, live) = seed(&mut store, 0.1);
        let (_, done) = seed(&mut store, 0.2);
        store.update_job_status(done.id, JobStatus::Succeeded, None).unwrap();

        let set = adapters(ScriptedAdapter::cloud(JobStatus::Running));
        let report = stop(&mut store, &set, "g", false).await.unwrap();

        assert_eq!(report.requested.len(), 1);
        assert_eq!(report.requested[0].id, live.id);
        // The finished job is an explicit no-op.
        assert_eq!(report.no_change.len(), 1);
        assert_eq!(report.no_change[0].id, done.id);

        // Current status is untouched; the request is in the history.
        let after = store.get_job(live.id).unwrap();
        assert_eq!(after.status, JobStatus::Submitted);
        let history = store.job_history(live.id).unwrap();
        assert_eq!(history.last().unwrap().message.as_deref(), Some("stop requested"));
    }

    #[tokio::test]
    async fn test_stop_dry_run_touches_nothing() {
        let mut store = RegistryStore::open_in_memory().unwrap();
        let (_, live) = seed(&mut store, 0.1);
        let set = adapters(ScriptedAdapter::cloud(JobStatus::Running));

        let report = stop(&mut store, &set, "g", true).await.unwrap();
        assert_eq!(report.requested.len(), 1);
        assert_eq!(store.job_history(live.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_resubmit_selects_failed_and_stopped() {
        let mut store = RegistryStore::open_in_memory().unwrap();
        let (_, ok) = seed(&mut store, 0.1);
        let (_, bad) = seed(&mut store, 0.2);
        store.update_job_status(ok.id, JobStatus::Succeeded, None).unwrap();
        store.update_job_status(bad.id, JobStatus::Failed, None).unwrap();

        let set = adapters(ScriptedAdapter::cloud(JobStatus::Running));
        let report = resubmit(
            &mut store,
            &set,
            "g",
            false,
            false,
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        // Only the failed experiment is resubmitted.
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].experiment.id, bad.experiment_id);
        let job = report.outcomes[0].job.as_ref().unwrap();
        assert_eq!(job.status, JobStatus::Submitted);

        // The new job reuses the same experiment row.
        let group = store.find_group("g").unwrap().unwrap();
        assert_eq!(store.experiments_in_group(&group).unwrap().len(), 2);
        let latest = store.latest_job_for_experiment(bad.experiment_id).unwrap().unwrap();
        assert_ne!(latest.id, bad.id);
    }

    #[tokio::test]
    async fn test_resubmit_all_jobs_widens_selection() {
        let mut store = RegistryStore::open_in_memory().unwrap();
        let (_, ok) = seed(&mut store, 0.1);
        store.update_job_status(ok.id, JobStatus::Succeeded, None).unwrap();

        let set = adapters(ScriptedAdapter::cloud(JobStatus::Running));
        let report = resubmit(
            &mut store,
            &set,
            "g",
            false,
            true,
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(report.outcomes.len(), 1);
    }

    #[tokio::test]
    async fn test_resubmit_uses_rebuilt_image() {
        let mut store = RegistryStore::open_in_memory().unwrap();
        let (_, bad) = seed(&mut store, 0.2);
        store.update_job_status(bad.id, JobStatus::Failed, None).unwrap();

        let set = adapters(ScriptedAdapter::cloud(JobStatus::Running));
        let report = resubmit(
            &mut store,
            &set,
            "g",
            false,
            false,
            Some("sha256:rebuilt".to_string()),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let job = report.outcomes[0].job.as_ref().unwrap();
        // The job carries the rebuilt container reference.
        assert_eq!(job.details["container"], "sha256:rebuilt");
    }

    #[tokio::test]
    async fn test_resubmit_dry_run_submits_nothing() {
        let mut store = RegistryStore::open_in_memory().unwrap();
        let (_, bad) = seed(&mut store, 0.2);
        store.update_job_status(bad.id, JobStatus::Failed, None).unwrap();

        let set = adapters(ScriptedAdapter::cloud(JobStatus::Running));
        let report = resubmit(
            &mut store,
            &set,
            "g",
            true,
            false,
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(report.outcomes.len(), 1);
        assert!(report.outcomes[0].job.is_none());
        let latest = store.latest_job_for_experiment(bad.experiment_id).unwrap().unwrap();
        assert_eq!(latest.id, bad.id);
    }

    #[tokio::test]
    async fn test_group_view_missing_group() {
        let mut store = RegistryStore::open_in_memory().unwrap();
        let set = AdapterSet::default();
        assert!(group(&mut store, &set, "nope", None).await.unwrap().is_none());
    }
}
