//! The registry store: transactional persistence for experiment groups,
//! containers, experiments, jobs, and job status history.
//!
//! All mutations run inside transactions; `get_or_create_*` methods are
//! idempotent on their identity keys, so resubmitting the same work reuses
//! the existing rows.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use tracing::debug;

use crate::config::{current_user, Entrypoint, JobMode};
use crate::experiment::ConfigValue;
use crate::registry::database::Database;
use crate::registry::error::{RegistryError, RegistryResult};
use crate::registry::types::{
    Backend, Container, ContainerView, Experiment, ExperimentGroup, ExperimentView, GroupView,
    Job, JobStatus, StatusEvent,
};

/// Handle to the registry database.
///
/// The store exclusively owns row storage; everything else reads row values
/// or requests mutations through these methods.
pub struct RegistryStore {
    db: Database,
}

impl RegistryStore {
    /// Opens (or creates) the registry at the given path.
    pub fn open(path: &Path) -> RegistryResult<Self> {
        Ok(Self { db: Database::open(path)? })
    }

    /// Opens an in-memory registry for testing.
    pub fn open_in_memory() -> RegistryResult<Self> {
        Ok(Self { db: Database::open_in_memory()? })
    }

    // ------------------------------------------------------------------
    // get_or_create
    // ------------------------------------------------------------------

    /// Finds or creates an experiment group for the current user.
    ///
    /// With no name supplied a timestamped default is generated, which makes
    /// every unnamed invocation its own group.
    pub fn get_or_create_group(&mut self, name: Option<&str>) -> RegistryResult<ExperimentGroup> {
        let user = current_user();
        let now = Utc::now();
        let name = match name {
            Some(n) => n.to_string(),
            None => ExperimentGroup::generate_name(&user, now),
        };

        self.db.transaction(|tx| {
            let existing = tx
                .query_row(
                    "SELECT id, user, name, created_at FROM experiment_groups
                     WHERE user = ?1 AND name = ?2",
                    params![user, name],
                    group_from_row,
                )
                .map(Some)
                .or_else(not_found_to_none)?;

            if let Some(group) = existing {
                return Ok(group);
            }

            tx.execute(
                "INSERT INTO experiment_groups (user, name, created_at) VALUES (?1, ?2, ?3)",
                params![user, name, now.to_rfc3339()],
            )?;
            let id = tx.last_insert_rowid();
            debug!(group = %name, id, "created experiment group");
            Ok(ExperimentGroup { id, user: user.clone(), name: name.clone(), created_at: now })
        })
    }

    /// Finds or creates a container row. Identity is the image reference:
    /// two invocations producing the same image share one row.
    pub fn get_or_create_container(
        &mut self,
        image_reference: &str,
        mode: JobMode,
        build_context_path: &Path,
        extra_dirs: &[String],
    ) -> RegistryResult<Container> {
        let now = Utc::now();
        let extra_dirs_json = serde_json::to_string(extra_dirs)?;
        let context = build_context_path.display().to_string();

        self.db.transaction(|tx| {
            let existing = tx
                .query_row(
                    "SELECT id, image_reference, mode, build_context_path, extra_dirs_json,
                            created_at
                     FROM containers WHERE image_reference = ?1",
                    params![image_reference],
                    container_from_row,
                )
                .map(Some)
                .or_else(not_found_to_none)?;

            if let Some(container) = existing {
                return Ok(container);
            }

            tx.execute(
                "INSERT INTO containers
                 (image_reference, mode, build_context_path, extra_dirs_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![image_reference, mode.to_string(), context, extra_dirs_json,
                        now.to_rfc3339()],
            )?;
            let id = tx.last_insert_rowid();
            debug!(image = %image_reference, id, "registered container");
            Ok(Container {
                id,
                image_reference: image_reference.to_string(),
                mode,
                build_context_path: context.clone(),
                extra_dirs: extra_dirs.to_vec(),
                created_at: now,
            })
        })
    }

    /// Finds or creates an experiment row. Identity is the full tuple of
    /// (group, container, entrypoint, args, kwargs), compared through their
    /// canonical JSON serializations.
    pub fn get_or_create_experiment(
        &mut self,
        group: &ExperimentGroup,
        container: &Container,
        entrypoint: &Entrypoint,
        args: &[String],
        kwargs: &[(String, ConfigValue)],
    ) -> RegistryResult<Experiment> {
        let now = Utc::now();
        let entrypoint_json = serde_json::to_string(entrypoint)?;
        let args_json = serde_json::to_string(args)?;
        let kwargs_json = serde_json::to_string(kwargs)?;
        let (group_id, container_id) = (group.id, container.id);

        self.db.transaction(|tx| {
            let existing = tx
                .query_row(
                    "SELECT id, group_id, container_id, entrypoint_json, args_json,
                            kwargs_json, created_at
                     FROM experiments
                     WHERE group_id = ?1 AND container_id = ?2 AND entrypoint_json = ?3
                       AND args_json = ?4 AND kwargs_json = ?5",
                    params![group_id, container_id, entrypoint_json, args_json, kwargs_json],
                    experiment_from_row,
                )
                .map(Some)
                .or_else(not_found_to_none)?;

            if let Some(experiment) = existing {
                return Ok(experiment);
            }

            tx.execute(
                "INSERT INTO experiments
                 (group_id, container_id, entrypoint_json, args_json, kwargs_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![group_id, container_id, entrypoint_json, args_json, kwargs_json,
                        now.to_rfc3339()],
            )?;
            let id = tx.last_insert_rowid();
            Ok(Experiment {
                id,
                group_id,
                container_id,
                entrypoint: entrypoint.clone(),
                args: args.to_vec(),
                kwargs: kwargs.to_vec(),
                created_at: now,
            })
        })
    }

    // ------------------------------------------------------------------
    // jobs
    // ------------------------------------------------------------------

    /// Records a new job in `Submitted` state, with its first history entry,
    /// in one transaction.
    pub fn create_job(
        &mut self,
        experiment: &Experiment,
        backend: Backend,
        backend_handle: &str,
        details: &serde_json::Value,
    ) -> RegistryResult<Job> {
        let now = Utc::now();
        let details_json = serde_json::to_string(details)?;
        let experiment_id = experiment.id;
        let status = JobStatus::Submitted;

        self.db.transaction(|tx| {
            tx.execute(
                "INSERT INTO jobs
                 (experiment_id, backend, backend_handle, details_json, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![experiment_id, backend.as_str(), backend_handle, details_json,
                        status.as_str(), now.to_rfc3339()],
            )?;
            let id = tx.last_insert_rowid();
            tx.execute(
                "INSERT INTO job_status_history (job_id, status, observed_at, message)
                 VALUES (?1, ?2, ?3, NULL)",
                params![id, status.as_str(), now.to_rfc3339()],
            )?;
            debug!(job = id, backend = %backend, handle = %backend_handle, "recorded job");
            Ok(Job {
                id,
                experiment_id,
                backend,
                backend_handle: backend_handle.to_string(),
                details: details.clone(),
                status,
                created_at: now,
            })
        })
    }

    /// Updates a job's current status and appends to its history.
    ///
    /// Re-observing the current status of a terminal job is a silent no-op;
    /// any other change away from a terminal status is rejected, so exactly
    /// one terminal status ever appears in a job's history.
    pub fn update_job_status(
        &mut self,
        job_id: i64,
        new_status: JobStatus,
        message: Option<&str>,
    ) -> RegistryResult<Job> {
        let job = self.get_job(job_id)?;

        if job.status.is_terminal() {
            if job.status == new_status {
                return Ok(job);
            }
            return Err(RegistryError::InvalidTransition {
                job_id,
                from: job.status,
                to: new_status,
            });
        }

        if !job.status.can_transition_to(new_status) {
            return Err(RegistryError::InvalidTransition {
                job_id,
                from: job.status,
                to: new_status,
            });
        }

        let now = Utc::now();
        self.db.transaction(|tx| {
            tx.execute(
                "UPDATE jobs SET status = ?1 WHERE id = ?2",
                params![new_status.as_str(), job_id],
            )?;
            tx.execute(
                "INSERT INTO job_status_history (job_id, status, observed_at, message)
                 VALUES (?1, ?2, ?3, ?4)",
                params![job_id, new_status.as_str(), now.to_rfc3339(), message],
            )?;
            Ok(())
        })?;

        self.get_job(job_id)
    }

    /// Fetches one job by id.
    pub fn get_job(&self, job_id: i64) -> RegistryResult<Job> {
        self.db
            .conn()
            .query_row(
                "SELECT id, experiment_id, backend, backend_handle, details_json, status,
                        created_at
                 FROM jobs WHERE id = ?1",
                params![job_id],
                job_from_row,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    RegistryError::NotFound(format!("job {}", job_id))
                }
                other => other.into(),
            })
    }

    /// Fetches one experiment by id.
    pub fn get_experiment(&self, experiment_id: i64) -> RegistryResult<Experiment> {
        self.db
            .conn()
            .query_row(
                "SELECT id, group_id, container_id, entrypoint_json, args_json, kwargs_json,
                        created_at
                 FROM experiments WHERE id = ?1",
                params![experiment_id],
                experiment_from_row,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    RegistryError::NotFound(format!("experiment {}", experiment_id))
                }
                other => other.into(),
            })
    }

    /// Fetches one container by id.
    pub fn get_container(&self, container_id: i64) -> RegistryResult<Container> {
        self.db
            .conn()
            .query_row(
                "SELECT id, image_reference, mode, build_context_path, extra_dirs_json,
                        created_at
                 FROM containers WHERE id = ?1",
                params![container_id],
                container_from_row,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    RegistryError::NotFound(format!("container {}", container_id))
                }
                other => other.into(),
            })
    }

    /// Looks up an experiment group by name for the current user.
    pub fn find_group(&self, name: &str) -> RegistryResult<Option<ExperimentGroup>> {
        let user = current_user();
        self.db
            .conn()
            .query_row(
                "SELECT id, user, name, created_at FROM experiment_groups
                 WHERE user = ?1 AND name = ?2",
                params![user, name],
                group_from_row,
            )
            .map(Some)
            .or_else(not_found_to_none)
    }

    /// Fetches one group by id.
    pub fn get_group(&self, group_id: i64) -> RegistryResult<ExperimentGroup> {
        self.db
            .conn()
            .query_row(
                "SELECT id, user, name, created_at FROM experiment_groups WHERE id = ?1",
                params![group_id],
                group_from_row,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    RegistryError::NotFound(format!("experiment group {}", group_id))
                }
                other => other.into(),
            })
    }

    // ------------------------------------------------------------------
    // queries
    // ------------------------------------------------------------------

    /// Most recent jobs across all groups, newest first; ties broken by id.
    pub fn list_recent_jobs(&self, limit: usize) -> RegistryResult<Vec<Job>> {
        let mut stmt = self.db.conn().prepare(
            "SELECT id, experiment_id, backend, backend_handle, details_json, status, created_at
             FROM jobs ORDER BY created_at DESC, id DESC LIMIT ?1",
        )?;
        let jobs = stmt
            .query_map(params![limit as i64], job_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    /// All experiments in a group, ordered by id.
    pub fn experiments_in_group(&self, group: &ExperimentGroup) -> RegistryResult<Vec<Experiment>> {
        let mut stmt = self.db.conn().prepare(
            "SELECT id, group_id, container_id, entrypoint_json, args_json, kwargs_json,
                    created_at
             FROM experiments WHERE group_id = ?1 ORDER BY id",
        )?;
        let experiments = stmt
            .query_map(params![group.id], experiment_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(experiments)
    }

    /// All jobs in a group, ordered by experiment id, then job creation time.
    pub fn jobs_in_group(&self, group: &ExperimentGroup) -> RegistryResult<Vec<Job>> {
        let mut stmt = self.db.conn().prepare(
            "SELECT j.id, j.experiment_id, j.backend, j.backend_handle, j.details_json,
                    j.status, j.created_at
             FROM jobs j JOIN experiments e ON j.experiment_id = e.id
             WHERE e.group_id = ?1
             ORDER BY e.id, j.created_at, j.id",
        )?;
        let jobs = stmt
            .query_map(params![group.id], job_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    /// Jobs in a group whose current status satisfies the predicate.
    pub fn jobs_in_group_matching<P>(
        &self,
        group: &ExperimentGroup,
        predicate: P,
    ) -> RegistryResult<Vec<Job>>
    where
        P: Fn(JobStatus) -> bool,
    {
        Ok(self.jobs_in_group(group)?.into_iter().filter(|j| predicate(j.status)).collect())
    }

    /// The most recent job for an experiment, if any.
    pub fn latest_job_for_experiment(&self, experiment_id: i64) -> RegistryResult<Option<Job>> {
        self.db
            .conn()
            .query_row(
                "SELECT id, experiment_id, backend, backend_handle, details_json, status,
                        created_at
                 FROM jobs WHERE experiment_id = ?1
                 ORDER BY created_at DESC, id DESC LIMIT 1",
                params![experiment_id],
                job_from_row,
            )
            .map(Some)
            .or_else(not_found_to_none)
    }

    /// A job's full status history, oldest first.
    pub fn job_history(&self, job_id: i64) -> RegistryResult<Vec<StatusEvent>> {
        let mut stmt = self.db.conn().prepare(
            "SELECT job_id, status, observed_at, message FROM job_status_history
             WHERE job_id = ?1 ORDER BY id",
        )?;
        let events = stmt
            .query_map(params![job_id], |row| {
                Ok(StatusEvent {
                    job_id: row.get(0)?,
                    status: parse_status_column(row, 1)?,
                    observed_at: parse_timestamp_column(row, 2)?,
                    message: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    /// Grouped view of a group's jobs: container, then experiment, then jobs
    /// by creation time. `max_per_experiment` keeps only each experiment's
    /// most recent jobs.
    pub fn group_view(
        &self,
        group: &ExperimentGroup,
        max_per_experiment: Option<usize>,
    ) -> RegistryResult<GroupView> {
        let jobs = self.jobs_in_group(group)?;
        let mut views = self.grouped_views_for_jobs(&jobs)?;
        let mut view = views
            .pop()
            .unwrap_or_else(|| GroupView { group: group.clone(), containers: Vec::new() });

        // An experiment with no jobs yet should still appear in its group.
        let experiments = self.experiments_in_group(group)?;
        for experiment in experiments {
            let present = view
                .containers
                .iter()
                .flat_map(|c| &c.experiments)
                .any(|ev| ev.experiment.id == experiment.id);
            if !present {
                let container = self.get_container(experiment.container_id)?;
                attach_experiment(&mut view, container, experiment, Vec::new());
            }
        }

        if let Some(max) = max_per_experiment {
            for container in &mut view.containers {
                for exp_view in &mut container.experiments {
                    let len = exp_view.jobs.len();
                    if len > max {
                        exp_view.jobs.drain(..len - max);
                    }
                }
            }
        }
        Ok(view)
    }

    /// Organizes an arbitrary set of jobs into per-group views ordered by
    /// group id, with containers and experiments ordered by id inside.
    pub fn grouped_views_for_jobs(&self, jobs: &[Job]) -> RegistryResult<Vec<GroupView>> {
        let mut views: Vec<GroupView> = Vec::new();

        for job in jobs {
            let experiment = self.get_experiment(job.experiment_id)?;
            let container = self.get_container(experiment.container_id)?;
            let group = self.get_group(experiment.group_id)?;

            let slot = match views.iter().position(|v| v.group.id == group.id) {
                Some(slot) => slot,
                None => {
                    views.push(GroupView { group, containers: Vec::new() });
                    views.len() - 1
                }
            };
            attach_experiment(&mut views[slot], container, experiment, vec![job.clone()]);
        }

        views.sort_by_key(|v| v.group.id);
        for view in &mut views {
            view.containers.sort_by_key(|c| c.container.id);
            for container in &mut view.containers {
                container.experiments.sort_by_key(|e| e.experiment.id);
                for exp_view in &mut container.experiments {
                    exp_view.jobs.sort_by_key(|j| (j.created_at, j.id));
                }
            }
        }
        Ok(views)
    }
}

/// Adds a job list to the right container/experiment slot of a view,
/// creating the slots as needed.
fn attach_experiment(
    view: &mut GroupView,
    container: Container,
    experiment: Experiment,
    jobs: Vec<Job>,
) {
    let slot = match view.containers.iter().position(|c| c.container.id == container.id) {
        Some(slot) => slot,
        None => {
            view.containers.push(ContainerView { container, experiments: Vec::new() });
            view.containers.len() - 1
        }
    };
    let container_view = &mut view.containers[slot];

    match container_view
        .experiments
        .iter_mut()
        .find(|e| e.experiment.id == experiment.id)
    {
        Some(exp_view) => exp_view.jobs.extend(jobs),
        None => container_view.experiments.push(ExperimentView { experiment, jobs }),
    }
}

// ----------------------------------------------------------------------
// row parsing helpers
// ----------------------------------------------------------------------

fn not_found_to_none<T>(e: rusqlite::Error) -> RegistryResult<Option<T>> {
    match e {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(other.into()),
    }
}

fn invalid_column(idx: usize, name: &str) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(idx, name.to_string(), rusqlite::types::Type::Text)
}

fn parse_timestamp_column(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| invalid_column(idx, "created_at"))
}

fn parse_status_column(row: &Row, idx: usize) -> rusqlite::Result<JobStatus> {
    let text: String = row.get(idx)?;
    JobStatus::parse(&text).ok_or_else(|| invalid_column(idx, "status"))
}

fn parse_json_column<T: serde::de::DeserializeOwned>(
    row: &Row,
    idx: usize,
    name: &str,
) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|_| invalid_column(idx, name))
}

fn group_from_row(row: &Row) -> rusqlite::Result<ExperimentGroup> {
    Ok(ExperimentGroup {
        id: row.get(0)?,
        user: row.get(1)?,
        name: row.get(2)?,
        created_at: parse_timestamp_column(row, 3)?,
    })
}

fn container_from_row(row: &Row) -> rusqlite::Result<Container> {
    let mode_text: String = row.get(2)?;
    let mode = JobMode::parse(&mode_text).map_err(|_| invalid_column(2, "mode"))?;
    Ok(Container {
        id: row.get(0)?,
        image_reference: row.get(1)?,
        mode,
        build_context_path: row.get(3)?,
        extra_dirs: parse_json_column(row, 4, "extra_dirs_json")?,
        created_at: parse_timestamp_column(row, 5)?,
    })
}

fn experiment_from_row(row: &Row) -> rusqlite::Result<Experiment> {
    Ok(Experiment {
        id: row.get(0)?,
        group_id: row.get(1)?,
        container_id: row.get(2)?,
        entrypoint: parse_json_column(row, 3, "entrypoint_json")?,
        args: parse_json_column(row, 4, "args_json")?,
        kwargs: parse_json_column(row, 5, "kwargs_json")?,
        created_at: parse_timestamp_column(row, 6)?,
    })
}

fn job_from_row(row: &Row) -> rusqlite::Result<Job> {
    let backend_text: String = row.get(2)?;
    let backend = Backend::parse(&backend_text).ok_or_else(|| invalid_column(2, "backend"))?;
    Ok(Job {
        id: row.get(0)?,
        experiment_id: row.get(1)?,
        backend,
        backend_handle: row.get(3)?,
        details: parse_json_column(row, 4, "details_json")?,
        status: parse_status_column(row, 5)?,
        created_at: parse_timestamp_column(row, 6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> RegistryStore {
        RegistryStore::open_in_memory().unwrap()
    }

    fn sample_entrypoint() -> Entrypoint {
        Entrypoint::PyModule { module: "trainer.main".to_string() }
    }

    fn seed_experiment(store: &mut RegistryStore) -> (ExperimentGroup, Container, Experiment) {
        let group = store.get_or_create_group(Some("tuning")).unwrap();
        let container = store
            .get_or_create_container("sha256:abc", JobMode::Cpu, Path::new("/proj"), &[])
            .unwrap();
        let experiment = store
            .get_or_create_experiment(
                &group,
                &container,
                &sample_entrypoint(),
                &[],
                &[("lr".to_string(), ConfigValue::Float(0.1))],
            )
            .unwrap();
        (group, container, experiment)
    }

    #[test]
    fn test_get_or_create_group_idempotent() {
        let mut store = store();
        let first = store.get_or_create_group(Some("sweep")).unwrap();
        let second = store.get_or_create_group(Some("sweep")).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.name, "sweep");
    }

    #[test]
    fn test_get_or_create_group_generates_default_name() {
        let mut store = store();
        let group = store.get_or_create_group(None).unwrap();
        assert!(group.name.contains("-xgroup-"), "got {}", group.name);
    }

    #[test]
    fn test_get_or_create_container_identity_is_image_reference() {
        let mut store = store();
        let first = store
            .get_or_create_container("sha256:abc", JobMode::Gpu, Path::new("/a"), &[])
            .unwrap();
        // Same image reference: row reused even if other fields differ.
        let second = store
            .get_or_create_container(
                "sha256:abc",
                JobMode::Cpu,
                Path::new("/b"),
                &["data".to_string()],
            )
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.mode, JobMode::Gpu);

        let third = store
            .get_or_create_container("sha256:def", JobMode::Gpu, Path::new("/a"), &[])
            .unwrap();
        assert_ne!(first.id, third.id);
    }

    #[test]
    fn test_get_or_create_experiment_identity() {
        let mut store = store();
        let (group, container, experiment) = seed_experiment(&mut store);

        let again = store
            .get_or_create_experiment(
                &group,
                &container,
                &sample_entrypoint(),
                &[],
                &[("lr".to_string(), ConfigValue::Float(0.1))],
            )
            .unwrap();
        assert_eq!(experiment.id, again.id);

        // Different kwargs: a distinct experiment.
        let other = store
            .get_or_create_experiment(
                &group,
                &container,
                &sample_entrypoint(),
                &[],
                &[("lr".to_string(), ConfigValue::Float(0.2))],
            )
            .unwrap();
        assert_ne!(experiment.id, other.id);
    }

    #[test]
    fn test_kwargs_order_is_identity() {
        let mut store = store();
        let (group, container, _) = seed_experiment(&mut store);
        let ab = store
            .get_or_create_experiment(
                &group,
                &container,
                &sample_entrypoint(),
                &[],
                &[
                    ("a".to_string(), ConfigValue::Int(1)),
                    ("b".to_string(), ConfigValue::Int(2)),
                ],
            )
            .unwrap();
        let ba = store
            .get_or_create_experiment(
                &group,
                &container,
                &sample_entrypoint(),
                &[],
                &[
                    ("b".to_string(), ConfigValue::Int(2)),
                    ("a".to_string(), ConfigValue::Int(1)),
                ],
            )
            .unwrap();
        assert_ne!(ab.id, ba.id);
    }

    #[test]
    fn test_create_job_initial_status_and_history() {
        let mut store = store();
        let (_, _, experiment) = seed_experiment(&mut store);
        let job = store
            .create_job(&experiment, Backend::Local, "container-1", &serde_json::json!({}))
            .unwrap();
        assert_eq!(job.status, JobStatus::Submitted);

        let history = store.job_history(job.id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, JobStatus::Submitted);
    }

    #[test]
    fn test_two_submissions_one_experiment_one_container() {
        let mut store = store();
        let (_, _, experiment) = seed_experiment(&mut store);
        let first = store
            .create_job(&experiment, Backend::Cloud, "job_1", &serde_json::json!({}))
            .unwrap();
        let second = store
            .create_job(&experiment, Backend::Cloud, "job_2", &serde_json::json!({}))
            .unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(first.experiment_id, second.experiment_id);
    }

    #[test]
    fn test_update_job_status_appends_history() {
        let mut store = store();
        let (_, _, experiment) = seed_experiment(&mut store);
        let job = store
            .create_job(&experiment, Backend::Cloud, "job_1", &serde_json::json!({}))
            .unwrap();

        store.update_job_status(job.id, JobStatus::Running, None).unwrap();
        let updated = store
            .update_job_status(job.id, JobStatus::Succeeded, Some("done"))
            .unwrap();
        assert_eq!(updated.status, JobStatus::Succeeded);

        let history = store.job_history(job.id).unwrap();
        let statuses: Vec<JobStatus> = history.iter().map(|e| e.status).collect();
        assert_eq!(
            statuses,
            vec![JobStatus::Submitted, JobStatus::Running, JobStatus::Succeeded]
        );
        // History is monotonic in observed_at.
        for pair in history.windows(2) {
            assert!(pair[0].observed_at <= pair[1].observed_at);
        }
    }

    #[test]
    fn test_terminal_status_is_final() {
        let mut store = store();
        let (_, _, experiment) = seed_experiment(&mut store);
        let job = store
            .create_job(&experiment, Backend::Cloud, "job_1", &serde_json::json!({}))
            .unwrap();
        store.update_job_status(job.id, JobStatus::Failed, None).unwrap();

        // Re-observation of the same terminal status is a no-op.
        let unchanged = store.update_job_status(job.id, JobStatus::Failed, None).unwrap();
        assert_eq!(unchanged.status, JobStatus::Failed);
        assert_eq!(store.job_history(job.id).unwrap().len(), 2);

        // Any other transition away from terminal is rejected.
        let err = store.update_job_status(job.id, JobStatus::Running, None).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTransition { .. }));
    }

    #[test]
    fn test_unknown_round_trips() {
        let mut store = store();
        let (_, _, experiment) = seed_experiment(&mut store);
        let job = store
            .create_job(&experiment, Backend::Cluster, "job-x", &serde_json::json!({}))
            .unwrap();

        store.update_job_status(job.id, JobStatus::Unknown, Some("query timeout")).unwrap();
        let back = store.update_job_status(job.id, JobStatus::Running, None).unwrap();
        assert_eq!(back.status, JobStatus::Running);
    }

    #[test]
    fn test_list_recent_jobs_newest_first() {
        let mut store = store();
        let (_, _, experiment) = seed_experiment(&mut store);
        for i in 0..5 {
            store
                .create_job(
                    &experiment,
                    Backend::Local,
                    &format!("c-{}", i),
                    &serde_json::json!({}),
                )
                .unwrap();
        }
        let recent = store.list_recent_jobs(3).unwrap();
        assert_eq!(recent.len(), 3);
        assert!(recent[0].id > recent[1].id);
        assert!(recent[1].id > recent[2].id);
    }

    #[test]
    fn test_jobs_in_group_matching() {
        let mut store = store();
        let (group, _, experiment) = seed_experiment(&mut store);
        let a = store
            .create_job(&experiment, Backend::Cloud, "a", &serde_json::json!({}))
            .unwrap();
        let b = store
            .create_job(&experiment, Backend::Cloud, "b", &serde_json::json!({}))
            .unwrap();
        store.update_job_status(a.id, JobStatus::Succeeded, None).unwrap();
        store.update_job_status(b.id, JobStatus::Running, None).unwrap();

        let live = store
            .jobs_in_group_matching(&group, |s| {
                matches!(s, JobStatus::Submitted | JobStatus::Running)
            })
            .unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, b.id);
    }

    #[test]
    fn test_group_view_limits_jobs_per_experiment() {
        let mut store = store();
        let (group, _, experiment) = seed_experiment(&mut store);
        for i in 0..4 {
            store
                .create_job(
                    &experiment,
                    Backend::Local,
                    &format!("c-{}", i),
                    &serde_json::json!({}),
                )
                .unwrap();
        }
        let view = store.group_view(&group, Some(2)).unwrap();
        assert_eq!(view.containers.len(), 1);
        let exp_view = &view.containers[0].experiments[0];
        assert_eq!(exp_view.jobs.len(), 2);
        // The survivors are the most recent jobs.
        assert_eq!(exp_view.jobs[1].backend_handle, "c-3");
    }

    #[test]
    fn test_group_view_includes_jobless_experiments() {
        let mut store = store();
        let (group, container, _) = seed_experiment(&mut store);
        store
            .get_or_create_experiment(
                &group,
                &container,
                &sample_entrypoint(),
                &[],
                &[("lr".to_string(), ConfigValue::Float(0.9))],
            )
            .unwrap();
        let view = store.group_view(&group, None).unwrap();
        let total: usize =
            view.containers.iter().map(|c| c.experiments.len()).sum();
        assert_eq!(total, 2);
    }

    #[test]
    fn test_latest_job_for_experiment() {
        let mut store = store();
        let (_, _, experiment) = seed_experiment(&mut store);
        assert!(store.latest_job_for_experiment(experiment.id).unwrap().is_none());

        store
            .create_job(&experiment, Backend::Cloud, "old", &serde_json::json!({}))
            .unwrap();
        let newest = store
            .create_job(&experiment, Backend::Cloud, "new", &serde_json::json!({}))
            .unwrap();
        let latest = store.latest_job_for_experiment(experiment.id).unwrap().unwrap();
        assert_eq!(latest.id, newest.id);
    }

    #[test]
    fn test_details_round_trip() {
        let mut store = store();
        let (_, _, experiment) = seed_experiment(&mut store);
        let details = serde_json::json!({"ret_code": 1, "url": "https://example.test/j/1"});
        let job = store
            .create_job(&experiment, Backend::Cloud, "j", &details)
            .unwrap();
        let fetched = store.get_job(job.id).unwrap();
        assert_eq!(fetched.details, details);
    }
}
