//! The dispatcher: one invocation's flow from project directory to
//! submitted jobs.
//!
//! Resolves the experiment group, builds (or accepts) the image, registers
//! the container, expands the experiment config, and submits each argument
//! tuple through the chosen backend adapter, recording every submission in
//! the registry. Failures are captured per tuple and do not abort the rest
//! of the sweep; only registry errors and user cancellation do.

use std::path::PathBuf;

use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::backend::{
    gpu_supported_on_host, AcceleratorSpec, Backend, BackendAdapter, BackendError, JobSpec,
    MachineType, Region,
};
use crate::build::{plan, BuildParams, DockerBuilder};
use crate::config::{Entrypoint, JobMode, ProjectConfig};
use crate::error::{CalibanError, Result};
use crate::experiment::{ArgTuple, ExperimentConfig};
use crate::registry::{Experiment, Job, JobStatus, RegistryStore};

/// A single user request with all parameters resolved; threaded explicitly
/// through the dispatcher so there is no process-wide mutable state.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub project_dir: PathBuf,
    pub mode: JobMode,
    pub backend: Backend,
    /// The module token: dotted module, python script, or shell script.
    pub module: String,
    /// Target experiment group; a timestamped default when absent.
    pub group_name: Option<String>,
    /// Parsed experiment config document, when one was supplied.
    pub experiment_config: Option<ExperimentConfig>,
    /// Arguments after the module token, prepended to every tuple verbatim.
    pub prefix_args: Vec<String>,
    /// Extra directories baked into the image, in user order.
    pub extra_dirs: Vec<String>,
    /// Extra dependency sets requested from the setup descriptor.
    pub setup_extras: Vec<String>,
    /// Direct image override; skips the build entirely.
    pub image: Option<String>,
    /// Validate and log without building, submitting, or writing rows.
    pub dry_run: bool,
    /// Base name for backend-visible job names.
    pub job_name: Option<String>,
    /// User labels attached to each submission.
    pub labels: Vec<(String, String)>,
    pub machine_type: Option<MachineType>,
    pub accelerator: Option<AcceleratorSpec>,
    pub region: Option<Region>,
    pub preemptible: bool,
    /// Extra args handed to `docker run` for the local backend.
    pub docker_run_args: Vec<String>,
    /// Build without the layer cache.
    pub no_cache: bool,
    /// Cloud project for image pushes and cloud submission.
    pub project_id: Option<String>,
}

impl Invocation {
    /// An invocation with everything defaulted except the essentials.
    pub fn new(project_dir: PathBuf, mode: JobMode, backend: Backend, module: &str) -> Self {
        Self {
            project_dir,
            mode,
            backend,
            module: module.to_string(),
            group_name: None,
            experiment_config: None,
            prefix_args: Vec::new(),
            extra_dirs: Vec::new(),
            setup_extras: Vec::new(),
            image: None,
            dry_run: false,
            job_name: None,
            labels: Vec::new(),
            machine_type: None,
            accelerator: None,
            region: None,
            preemptible: false,
            docker_run_args: Vec::new(),
            no_cache: false,
            project_id: None,
        }
    }
}

/// What happened to one argument tuple of a sweep.
#[derive(Debug)]
pub struct TupleOutcome {
    /// 1-based position in the enumeration order.
    pub index: usize,
    /// The materialized argv for this tuple.
    pub args: Vec<String>,
    /// The recorded job on success.
    pub job: Option<Job>,
    /// The failure, when this tuple did not submit.
    pub error: Option<BackendError>,
}

impl TupleOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Result of a full dispatcher invocation.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub outcomes: Vec<TupleOutcome>,
}

impl DispatchReport {
    /// True iff every attempted tuple succeeded.
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(TupleOutcome::succeeded)
    }

    pub fn succeeded_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.succeeded()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.len() - self.succeeded_count()
    }

    /// Process exit code for the invocation: 0 when every tuple succeeded,
    /// 2 when the only failures were client-side validation rejections, 1
    /// for any submission failure.
    pub fn exit_code(&self) -> i32 {
        if self.all_succeeded() {
            return 0;
        }
        let only_validation = self
            .outcomes
            .iter()
            .filter_map(|o| o.error.as_ref())
            .all(|e| matches!(e, BackendError::Validation { .. }));
        if only_validation {
            2
        } else {
            1
        }
    }
}

/// Runs one invocation end to end.
pub async fn dispatch(
    store: &mut RegistryStore,
    adapter: &dyn BackendAdapter,
    invocation: &Invocation,
    config: &ProjectConfig,
    cancel: &CancellationToken,
) -> Result<DispatchReport> {
    check_platform(invocation)?;

    let entrypoint = Entrypoint::resolve(&invocation.project_dir, &invocation.module)?;
    let tuples = expand_tuples(invocation);
    let total = tuples.len();

    if invocation.dry_run {
        return dry_run(adapter, invocation, &entrypoint, &tuples);
    }

    let image = resolve_image(invocation, config, &entrypoint, cancel).await?;
    info!(image = %image, "using image");

    let group = store.get_or_create_group(invocation.group_name.as_deref())?;
    let container = store.get_or_create_container(
        &image,
        invocation.mode,
        &invocation.project_dir,
        &invocation.extra_dirs,
    )?;

    let mut report = DispatchReport::default();
    for (i, tuple) in tuples.iter().enumerate() {
        let index = i + 1;
        if cancel.is_cancelled() {
            info!("cancelled; {} of {} tuples not submitted", total - i, total);
            return Err(CalibanError::Cancelled);
        }

        let experiment = store.get_or_create_experiment(
            &group,
            &container,
            &entrypoint,
            &invocation.prefix_args,
            &tuple.bindings,
        )?;

        let spec = job_spec(invocation, &image, &entrypoint, &experiment, index);
        let outcome = submit_tuple(store, adapter, &experiment, spec, cancel).await;

        match &outcome {
            Ok(job) => {
                info!(
                    "{} job {}/{} submitted as {} ({} ok, {} failed)",
                    "ok".green().bold(),
                    index,
                    total,
                    job.backend_handle.bold(),
                    report.succeeded_count() + 1,
                    report.failed_count(),
                );
            }
            Err(BackendError::Cancelled) => return Err(CalibanError::Cancelled),
            Err(e) => {
                error!(
                    "{} job {}/{} failed: {} (args: {})",
                    "error".red().bold(),
                    index,
                    total,
                    e,
                    experiment.to_args().join(" "),
                );
            }
        }

        report.outcomes.push(TupleOutcome {
            index,
            args: experiment.to_args(),
            job: outcome.as_ref().ok().cloned(),
            error: outcome.err(),
        });
    }

    info!(
        "sweep finished: {} submitted, {} failed",
        report.succeeded_count().to_string().green(),
        report.failed_count().to_string().red(),
    );
    Ok(report)
}

/// Submits one spec and records the job row. Used by the dispatcher loop
/// and by resubmission.
pub(crate) async fn submit_tuple(
    store: &mut RegistryStore,
    adapter: &dyn BackendAdapter,
    experiment: &Experiment,
    spec: JobSpec,
    cancel: &CancellationToken,
) -> std::result::Result<Job, BackendError> {
    adapter.validate(&spec)?;

    let submitted = adapter.submit(&spec, cancel).await?;
    let mut details = submitted.details;
    if let Some(map) = details.as_object_mut() {
        map.insert("container".to_string(), serde_json::Value::String(spec.image.clone()));
    }
    let job = store
        .create_job(experiment, adapter.backend(), &submitted.backend_handle, &details)
        .map_err(|e| BackendError::Terminal(format!("registry write failed: {}", e)))?;

    // The local runtime finishes synchronously, so its terminal state is
    // known the moment submit returns.
    if adapter.backend() == Backend::Local {
        let code = details.get("ret_code").and_then(|v| v.as_i64()).unwrap_or(-1);
        let status = if code == 0 { JobStatus::Succeeded } else { JobStatus::Failed };
        let job = store
            .update_job_status(job.id, status, Some(&format!("exit code {}", code)))
            .map_err(|e| BackendError::Terminal(format!("registry write failed: {}", e)))?;
        if code != 0 {
            return Err(BackendError::RuntimeExit { code: code as i32 });
        }
        return Ok(job);
    }

    Ok(job)
}

/// Builds the per-tuple job spec from the invocation's backend options.
fn job_spec(
    invocation: &Invocation,
    image: &str,
    entrypoint: &Entrypoint,
    experiment: &Experiment,
    index: usize,
) -> JobSpec {
    let mut spec =
        JobSpec::new(image, entrypoint.clone(), experiment.to_args(), invocation.mode);
    spec.machine_type = invocation.machine_type;
    spec.accelerator = invocation.accelerator;
    spec.region = invocation.region;
    spec.preemptible = invocation.preemptible;
    spec.labels = invocation.labels.clone();
    spec.job_name = invocation.job_name.clone();
    spec.index = index;
    spec
}

/// Expands the invocation's experiment config; an absent or empty document
/// yields exactly one empty tuple.
fn expand_tuples(invocation: &Invocation) -> Vec<ArgTuple> {
    match &invocation.experiment_config {
        Some(config) => config.expand(),
        None => vec![ArgTuple::empty()],
    }
}

/// GPU mode submitted to the local runtime on a host that cannot run GPU
/// containers is rejected before any work happens.
fn check_platform(invocation: &Invocation) -> Result<()> {
    if invocation.mode.is_gpu()
        && invocation.backend == Backend::Local
        && !gpu_supported_on_host()
    {
        return Err(CalibanError::PlatformUnsupported(
            "GPU mode requires a Linux Docker host for local execution; \
             use CPU mode or submit to a managed backend"
                .to_string(),
        ));
    }
    Ok(())
}

/// The image for this invocation: the explicit override, or a fresh build
/// (pushed to the project registry for remote backends).
async fn resolve_image(
    invocation: &Invocation,
    config: &ProjectConfig,
    entrypoint: &Entrypoint,
    cancel: &CancellationToken,
) -> Result<String> {
    if let Some(image) = &invocation.image {
        return Ok(image.clone());
    }
    if cancel.is_cancelled() {
        return Err(CalibanError::Cancelled);
    }

    let mut params =
        BuildParams::new(&invocation.project_dir, invocation.mode, entrypoint.clone());
    params.extra_dirs = invocation.extra_dirs.clone();
    params.setup_extras = invocation.setup_extras.clone();
    params.credentials_path = config
        .cloud_key
        .clone()
        .or_else(|| std::env::var("GOOGLE_APPLICATION_CREDENTIALS").ok())
        .map(PathBuf::from);

    let recipe = plan(&params, config)?;
    let builder = DockerBuilder::new(invocation.no_cache).map_err(CalibanError::Recipe)?;
    let image_id = builder.build(&recipe, &params).await?;

    if invocation.backend == Backend::Local {
        return Ok(image_id);
    }

    let project_id = invocation
        .project_id
        .clone()
        .or_else(|| config.project_id.clone())
        .ok_or_else(|| {
            crate::config::ConfigError::Invalid(
                "remote submission needs a project id; pass --project_id or set one in the \
                 project config"
                    .to_string(),
            )
        })?;
    Ok(builder.push(&project_id, &image_id).await?)
}

/// Dry-run: validate every tuple and log what would be submitted. No image
/// is built and no registry rows are created.
fn dry_run(
    adapter: &dyn BackendAdapter,
    invocation: &Invocation,
    entrypoint: &Entrypoint,
    tuples: &[ArgTuple],
) -> Result<DispatchReport> {
    let image = invocation.image.clone().unwrap_or_else(|| "<unbuilt>".to_string());
    let mut report = DispatchReport::default();

    for (i, tuple) in tuples.iter().enumerate() {
        let index = i + 1;
        let args = tuple.to_args(&invocation.prefix_args);
        let mut spec = JobSpec::new(&image, entrypoint.clone(), args.clone(), invocation.mode);
        spec.machine_type = invocation.machine_type;
        spec.accelerator = invocation.accelerator;
        spec.region = invocation.region;
        spec.index = index;

        let error = adapter.validate(&spec).err();
        match &error {
            None => info!(
                "{} would submit job {}/{}: {} {}",
                "dry-run".yellow().bold(),
                index,
                tuples.len(),
                entrypoint.target(),
                args.join(" "),
            ),
            Some(e) => error!(
                "{} job {}/{} would be rejected: {}",
                "dry-run".yellow().bold(),
                index,
                tuples.len(),
                e,
            ),
        }
        report.outcomes.push(TupleOutcome { index, args, job: None, error });
    }
    Ok(report)
}
