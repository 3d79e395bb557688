//! Shared argument structs and helpers for the command implementations.

use std::path::PathBuf;

use caliban_core::backend::{
    AcceleratorSpec, HttpBatchApi, HttpTrainingApi, KubernetesCluster, LocalRuntime,
    MachineType, Region,
};
use caliban_core::config::{registry_db_path, ConfigError, JobMode, ProjectConfig};
use caliban_core::dispatch::{DispatchReport, Invocation};
use caliban_core::error::CalibanError;
use caliban_core::experiment::ExperimentConfig;
use caliban_core::registry::{Backend, RegistryStore};
use caliban_core::status::AdapterSet;
use caliban_core::CloudTraining;
use clap::Args;

/// Result carrying a process exit code.
pub type CliResult = std::result::Result<i32, CalibanError>;

/// Environment variable carrying the cloud project id.
pub const PROJECT_ID_ENV: &str = "PROJECT_ID";
/// Environment variable carrying the cloud submission region.
pub const REGION_ENV: &str = "REGION";
/// Environment variable carrying a bearer token for the training service.
pub const CLOUD_TOKEN_ENV: &str = "CALIBAN_CLOUD_TOKEN";
/// Environment variables locating the Kubernetes cluster endpoint.
pub const CLUSTER_ENDPOINT_ENV: &str = "CALIBAN_CLUSTER_ENDPOINT";
pub const CLUSTER_NAMESPACE_ENV: &str = "CALIBAN_CLUSTER_NAMESPACE";
pub const CLUSTER_TOKEN_ENV: &str = "CALIBAN_CLUSTER_TOKEN";

/// Arguments shared by every job-submitting verb.
#[derive(Args, Debug, Clone)]
pub struct JobArgs {
    /// Python module (a.b.c), python script, or shell script to execute
    pub module: String,

    /// Arguments passed through to every job, prepended to each expanded
    /// tuple
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub script_args: Vec<String>,

    /// Project directory (defaults to the current directory)
    #[arg(short = 'd', long)]
    pub dir: Option<String>,

    /// Job mode (cpu, gpu, tpu)
    #[arg(long, default_value = "cpu")]
    pub mode: String,

    /// Experiment config: a file path, or "stdin" to read the document from
    /// standard input
    #[arg(short = 'e', long = "experiment_config")]
    pub experiment_config: Option<String>,

    /// Experiment group collecting these jobs; a timestamped default is
    /// generated when absent
    #[arg(long)]
    pub xgroup: Option<String>,

    /// Validate and log without building or submitting
    #[arg(long = "dry_run")]
    pub dry_run: bool,

    /// Extra directories to copy into the image, in order
    #[arg(short = 'D', long = "extra_dirs")]
    pub extra_dirs: Vec<String>,

    /// Extra dependency sets installed from setup.py
    #[arg(long)]
    pub extras: Vec<String>,

    /// Use an existing image instead of building one
    #[arg(long)]
    pub image: Option<String>,

    /// Build without Docker's layer cache
    #[arg(long = "no_cache")]
    pub no_cache: bool,

    /// Base name for backend job names
    #[arg(long)]
    pub name: Option<String>,

    /// Labels attached to each submission, as key=value
    #[arg(long = "label")]
    pub labels: Vec<String>,
}

/// Cloud-specific submission options.
#[derive(Args, Debug, Clone)]
pub struct CloudArgs {
    /// Cloud project id; falls back to the project config, then $PROJECT_ID
    #[arg(long = "project_id")]
    pub project_id: Option<String>,

    /// Submission region; falls back to $REGION, then the default
    #[arg(long)]
    pub region: Option<String>,

    /// Machine type, e.g. n1-standard-8
    #[arg(long = "machine_type")]
    pub machine_type: Option<String>,

    /// GPU request of the form COUNTxTYPE, e.g. 8xV100
    #[arg(long = "gpu_spec")]
    pub gpu_spec: Option<String>,

    /// TPU request of the form COUNTxTYPE, e.g. 8xV2
    #[arg(long = "tpu_spec")]
    pub tpu_spec: Option<String>,

    /// Skip client-side validation of the resource combination
    #[arg(long)]
    pub force: bool,
}

/// Cluster-specific submission options.
#[derive(Args, Debug, Clone)]
pub struct ClusterArgs {
    /// Cluster API endpoint; falls back to $CALIBAN_CLUSTER_ENDPOINT
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Cluster namespace
    #[arg(long, default_value = "default")]
    pub namespace: String,

    /// Write job manifests to this directory instead of submitting
    #[arg(long = "export_dir")]
    pub export_dir: Option<PathBuf>,

    /// Request preemptible capacity
    #[arg(long)]
    pub preemptible: bool,

    /// GPU request of the form COUNTxTYPE, e.g. 2xT4
    #[arg(long = "gpu_spec")]
    pub gpu_spec: Option<String>,
}

/// Resolves the project directory: explicit flag or the current directory.
pub fn project_dir(dir: &Option<String>) -> Result<PathBuf, CalibanError> {
    match dir {
        Some(dir) => Ok(PathBuf::from(dir)),
        None => Ok(std::env::current_dir()?),
    }
}

/// Loads the experiment config from a path or from standard input.
pub fn load_experiment_config(
    source: &Option<String>,
) -> Result<Option<ExperimentConfig>, CalibanError> {
    let source = match source {
        Some(source) => source,
        None => return Ok(None),
    };
    let config = if source.eq_ignore_ascii_case("stdin") {
        ExperimentConfig::from_reader(std::io::stdin().lock())?
    } else {
        ExperimentConfig::from_path(std::path::Path::new(source))?
    };
    Ok(Some(config))
}

/// Parses `key=value` label arguments.
pub fn parse_labels(labels: &[String]) -> Result<Vec<(String, String)>, CalibanError> {
    labels
        .iter()
        .map(|raw| {
            raw.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.to_string()))
                .ok_or_else(|| {
                    ConfigError::Invalid(format!(
                        "couldn't parse label '{}' into k=v format",
                        raw
                    ))
                    .into()
                })
        })
        .collect()
}

/// Builds the core invocation from the shared job arguments.
pub fn invocation(job: &JobArgs, backend: Backend) -> Result<Invocation, CalibanError> {
    let mode = JobMode::parse(&job.mode)?;
    let mut inv = Invocation::new(project_dir(&job.dir)?, mode, backend, &job.module);
    inv.group_name = job.xgroup.clone();
    inv.experiment_config = load_experiment_config(&job.experiment_config)?;
    inv.prefix_args = strip_separator(&job.script_args);
    inv.extra_dirs = job.extra_dirs.clone();
    inv.setup_extras = job.extras.clone();
    inv.image = job.image.clone();
    inv.dry_run = job.dry_run;
    inv.job_name = job.name.clone();
    inv.labels = parse_labels(&job.labels)?;
    inv.no_cache = job.no_cache;
    Ok(inv)
}

/// Resolves cloud options onto an invocation.
pub fn apply_cloud_args(
    inv: &mut Invocation,
    config: &ProjectConfig,
    cloud: &CloudArgs,
) -> Result<(), CalibanError> {
    inv.project_id = cloud
        .project_id
        .clone()
        .or_else(|| config.project_id.clone())
        .or_else(|| std::env::var(PROJECT_ID_ENV).ok());

    let region_source =
        cloud.region.clone().or_else(|| std::env::var(REGION_ENV).ok().filter(|r| !r.is_empty()));
    inv.region = match region_source {
        Some(r) => Some(Region::parse(&r)?),
        None => None,
    };

    inv.machine_type = match &cloud.machine_type {
        Some(m) => Some(MachineType::parse(m)?),
        None => None,
    };

    inv.accelerator = match (&cloud.gpu_spec, &cloud.tpu_spec) {
        (Some(_), Some(_)) => {
            return Err(ConfigError::Invalid(
                "pass either --gpu_spec or --tpu_spec, not both".to_string(),
            )
            .into())
        }
        (Some(gpu), None) => Some(AcceleratorSpec::parse(gpu)?),
        (None, Some(tpu)) => Some(AcceleratorSpec::parse(tpu)?),
        (None, None) => None,
    };
    Ok(())
}

/// The `--` separator before trailing script args is dropped.
fn strip_separator(args: &[String]) -> Vec<String> {
    match args.first() {
        Some(first) if first == "--" => args[1..].to_vec(),
        _ => args.to_vec(),
    }
}

/// Opens the registry at its configured location.
pub fn open_store() -> Result<RegistryStore, CalibanError> {
    Ok(RegistryStore::open(&registry_db_path())?)
}

/// The cloud training adapter, when a project id can be resolved.
pub fn cloud_adapter(project_id: &str, force: bool) -> CloudTraining {
    let token = std::env::var(CLOUD_TOKEN_ENV).ok();
    CloudTraining::new(Box::new(HttpTrainingApi::new(project_id, token)), project_id, force)
}

/// The cluster adapter, when an endpoint is known.
pub fn cluster_adapter(
    endpoint: &str,
    namespace: &str,
    export_dir: Option<PathBuf>,
) -> KubernetesCluster {
    let token = std::env::var(CLUSTER_TOKEN_ENV).ok();
    KubernetesCluster::new(Box::new(HttpBatchApi::new(endpoint, namespace, token)), export_dir)
}

/// Every adapter that can be configured from the current environment, for
/// status, stop, and resubmit. Backends without configuration stay empty
/// and their jobs are reported from the registry alone.
pub fn adapter_set() -> AdapterSet {
    let mut set = AdapterSet::default();

    if let Ok(runtime) = LocalRuntime::new(Vec::new()) {
        set.local = Some(Box::new(runtime));
    }
    if let Ok(project_id) = std::env::var(PROJECT_ID_ENV) {
        set.cloud = Some(Box::new(cloud_adapter(&project_id, false)));
    }
    if let Ok(endpoint) = std::env::var(CLUSTER_ENDPOINT_ENV) {
        let namespace = std::env::var(CLUSTER_NAMESPACE_ENV)
            .unwrap_or_else(|_| "default".to_string());
        set.cluster = Some(Box::new(cluster_adapter(&endpoint, &namespace, None)));
    }
    set
}

/// Exit code for a dispatch report: success iff every tuple succeeded;
/// pure validation failures exit 2, submission failures exit 1.
pub fn report_exit(report: &DispatchReport) -> i32 {
    report.exit_code()
}
