//! Caliban CLI - dispatch containerized experiments from the command line.
//!
//! The `caliban` command packages the current project directory into a
//! Docker image and runs it locally, on the managed cloud training service,
//! or on a Kubernetes cluster, keeping a local registry of every submission.

mod commands;

use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use commands::common::{CloudArgs, ClusterArgs, JobArgs};
use commands::{build, cloud, cluster, expand, notebook, resubmit, run, shell, status, stop};

/// Exit code used when the user interrupts an invocation.
const EXIT_CANCELLED: i32 = 130;

/// Caliban - reproducible containerized experiments
///
/// Caliban wraps your research code in a Docker image and submits it to a
/// local runtime, the cloud training service, or a Kubernetes cluster,
/// expanding experiment configs into full parameter sweeps.
#[derive(Parser, Debug)]
#[command(
    name = "caliban",
    author,
    version,
    about = "Caliban - reproducible containerized experiments"
)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build the container image for a project without running anything
    Build {
        #[command(flatten)]
        job: JobArgs,
    },

    /// Run jobs on the local Docker runtime
    ///
    /// Executes one container per expanded experiment tuple, sequentially,
    /// with the working directory and home directory mounted inside.
    Run {
        #[command(flatten)]
        job: JobArgs,

        /// Extra arguments passed to `docker run`
        #[arg(long = "docker_run_args")]
        docker_run_args: Vec<String>,
    },

    /// Submit jobs to the managed cloud training service
    #[command(name = "submit-cloud")]
    SubmitCloud {
        #[command(flatten)]
        job: JobArgs,

        #[command(flatten)]
        cloud: CloudArgs,
    },

    /// Submit jobs to a managed Kubernetes cluster
    #[command(name = "submit-cluster")]
    SubmitCluster {
        #[command(flatten)]
        job: JobArgs,

        #[command(flatten)]
        cluster: ClusterArgs,
    },

    /// Open an interactive shell inside the built image
    Shell {
        /// Project directory (defaults to the current directory)
        #[arg(short = 'd', long)]
        dir: Option<String>,

        /// Job mode (cpu, gpu, tpu)
        #[arg(long, default_value = "cpu")]
        mode: String,

        /// Use an existing image instead of building
        #[arg(long)]
        image: Option<String>,
    },

    /// Launch a Jupyter server inside the built image
    Notebook {
        /// Project directory (defaults to the current directory)
        #[arg(short = 'd', long)]
        dir: Option<String>,

        /// Job mode (cpu, gpu, tpu)
        #[arg(long, default_value = "cpu")]
        mode: String,

        /// Port exposed for the notebook server
        #[arg(short, long, default_value_t = 8888)]
        port: u16,

        /// Launch classic Jupyter instead of JupyterLab
        #[arg(long)]
        classic: bool,
    },

    /// Show recent jobs, or one experiment group's jobs
    Status {
        /// Experiment group to inspect; recent jobs across groups if absent
        #[arg(long)]
        xgroup: Option<String>,

        /// Maximum jobs to show (per experiment with --xgroup)
        #[arg(long = "max_jobs")]
        max_jobs: Option<usize>,
    },

    /// Stop the running jobs of an experiment group
    Stop {
        /// Experiment group whose jobs should be stopped
        xgroup: String,

        /// List what would be stopped without stopping anything
        #[arg(long = "dry_run")]
        dry_run: bool,
    },

    /// Resubmit failed or stopped jobs of an experiment group
    Resubmit {
        /// Experiment group to resubmit
        xgroup: String,

        /// Resubmit every experiment, not only failed or stopped ones
        #[arg(long = "all_jobs")]
        all_jobs: bool,

        /// List what would be resubmitted without submitting
        #[arg(long = "dry_run")]
        dry_run: bool,

        /// Rebuild the image from this project directory first, so code
        /// changes are captured
        #[arg(short = 'd', long)]
        dir: Option<String>,

        /// Override the recorded job mode for the rebuild (cpu, gpu, tpu)
        #[arg(long)]
        mode: Option<String>,
    },

    /// Expand an experiment config and print one argv line per job
    #[command(name = "expand-experiments")]
    ExpandExperiments {
        /// Path to the experiment config, or "stdin"
        experiment_config: String,

        /// Arguments prepended to every expanded tuple
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        script_args: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber =
        FmtSubscriber::builder().with_max_level(level).without_time().with_target(false).finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("failed to install log subscriber");
    }

    let command = match args.command {
        Some(command) => command,
        None => {
            let _ = Args::command().print_help();
            std::process::exit(0);
        }
    };

    // A single interrupt abandons the in-flight submission and stops the
    // sweep; the registry stays consistent because writes are transactional.
    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_token.cancel();
        }
    });

    let result = match command {
        Command::Build { job } => build::execute(job).await,
        Command::Run { job, docker_run_args } => {
            run::execute(job, docker_run_args, &cancel).await
        }
        Command::SubmitCloud { job, cloud: cloud_args } => {
            cloud::execute(job, cloud_args, &cancel).await
        }
        Command::SubmitCluster { job, cluster: cluster_args } => {
            cluster::execute(job, cluster_args, &cancel).await
        }
        Command::Shell { dir, mode, image } => shell::execute(dir, mode, image).await,
        Command::Notebook { dir, mode, port, classic } => {
            notebook::execute(dir, mode, port, classic).await
        }
        Command::Status { xgroup, max_jobs } => status::execute(xgroup, max_jobs).await,
        Command::Stop { xgroup, dry_run } => stop::execute(xgroup, dry_run).await,
        Command::Resubmit { xgroup, all_jobs, dry_run, dir, mode } => {
            resubmit::execute(xgroup, all_jobs, dry_run, dir, mode, &cancel).await
        }
        Command::ExpandExperiments { experiment_config, script_args } => {
            expand::execute(experiment_config, script_args).await
        }
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            use colored::Colorize;
            eprintln!("{} {}", "error:".red().bold(), e);
            let code = if cancel.is_cancelled() { EXIT_CANCELLED } else { e.exit_code() };
            std::process::exit(code);
        }
    }
}
