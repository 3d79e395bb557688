//! Caliban Core - engine for reproducible containerized experiments.
//!
//! This crate provides the core functionality for Caliban:
//! - deterministic image build planning from a project directory
//! - experiment config expansion into ordered argument tuples
//! - submission adapters for the local runtime, the managed cloud training
//!   service, and a managed Kubernetes cluster
//! - the persistent registry of experiment groups, experiments, and jobs
//!   that drives status, stop, and resubmit
//!
//! # Example
//!
//! ```rust,no_run
//! use caliban_core::config::{JobMode, ProjectConfig};
//! use caliban_core::dispatch::{dispatch, Invocation};
//! use caliban_core::backend::{Backend, LocalRuntime};
//! use caliban_core::registry::RegistryStore;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> caliban_core::error::Result<()> {
//!     let mut store = RegistryStore::open(&caliban_core::config::registry_db_path())?;
//!     let invocation = Invocation::new(
//!         std::env::current_dir()?,
//!         JobMode::Cpu,
//!         Backend::Local,
//!         "trainer.main",
//!     );
//!     let adapter = LocalRuntime::new(Vec::new())?;
//!     let config = ProjectConfig::load(&invocation.project_dir)?;
//!     let report =
//!         dispatch(&mut store, &adapter, &invocation, &config, &CancellationToken::new())
//!             .await?;
//!     std::process::exit(if report.all_succeeded() { 0 } else { 1 });
//! }
//! ```

pub mod backend;
pub mod build;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod experiment;
pub mod registry;
pub mod status;

pub use backend::{
    AcceleratorSpec, BackendAdapter, BackendError, CloudTraining, JobSpec, KubernetesCluster,
    LocalRuntime, MachineType, Region,
};
pub use config::{Entrypoint, JobMode, ProjectConfig};
pub use dispatch::{dispatch, DispatchReport, Invocation};
pub use error::{CalibanError, Result};
pub use experiment::{ArgTuple, ConfigValue, ExperimentConfig};
pub use registry::{Backend, Job, JobStatus, RegistryStore};
pub use status::AdapterSet;
