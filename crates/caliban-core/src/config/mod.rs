//! Project configuration for Caliban.
//!
//! This module defines the job mode vocabulary, the entrypoint variants, and
//! the parsed form of the optional `.calibanconfig.json` document that a
//! project directory may carry (apt packages, base image overrides, Cloud SQL
//! proxy settings).

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// File name of the per-project configuration document.
pub const PROJECT_CONFIG_FILE: &str = ".calibanconfig.json";

/// Environment variable overriding the registry database location.
pub const DB_PATH_ENV: &str = "CALIBAN_DB_PATH";

/// Errors raised while loading or interpreting configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Malformed or rejected configuration content.
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// Serialization/deserialization error.
    #[error("Configuration parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// I/O error while reading a configuration file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Execution mode for a job's container.
///
/// The mode selects the base image family, the apt package set, and the
/// dependency extras installed into the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobMode {
    /// CPU-only execution.
    #[default]
    Cpu,
    /// GPU-accelerated execution.
    Gpu,
    /// Execution on a TPU host.
    Tpu,
}

impl JobMode {
    /// Parses a mode label, ignoring case and surrounding whitespace.
    pub fn parse(label: &str) -> ConfigResult<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(JobMode::Cpu),
            "gpu" => Ok(JobMode::Gpu),
            "tpu" => Ok(JobMode::Tpu),
            other => Err(ConfigError::Invalid(format!(
                "'{}' is not a valid job mode; expected cpu, gpu, or tpu",
                other
            ))),
        }
    }

    /// Returns true for GPU mode.
    pub fn is_gpu(&self) -> bool {
        matches!(self, JobMode::Gpu)
    }

    /// Lowercase tag spliced into `{}` placeholders in base image overrides
    /// and used as the dependency extras name.
    pub fn tag(&self) -> &'static str {
        match self {
            JobMode::Cpu => "cpu",
            JobMode::Gpu => "gpu",
            JobMode::Tpu => "tpu",
        }
    }
}

impl fmt::Display for JobMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobMode::Cpu => "CPU",
            JobMode::Gpu => "GPU",
            JobMode::Tpu => "TPU",
        };
        write!(f, "{}", s)
    }
}

/// What a container executes when it starts.
///
/// Parsed once at the boundary so downstream code never sniffs strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Entrypoint {
    /// A python module executed with `python -m`.
    PyModule { module: String },
    /// A python script executed with `python`.
    PyScript { path: PathBuf },
    /// Any other executable file, run through `/bin/bash`.
    Shell { path: PathBuf },
}

impl Entrypoint {
    /// Resolves a module token against a project directory.
    ///
    /// A token that names an existing file resolves by extension (`.py` runs
    /// as a python script, everything else through `/bin/bash`). Otherwise
    /// the token must be a dotted chain of python identifiers and resolves to
    /// a module invocation.
    ///
    /// # Errors
    /// `ConfigError::Invalid` if the token is neither an existing file nor a
    /// valid dotted module path.
    pub fn resolve(project_dir: &Path, token: &str) -> ConfigResult<Self> {
        if project_dir.join(token).is_file() {
            return Ok(Self::from_file_token(token));
        }

        if is_dotted_module(token) {
            return Ok(Entrypoint::PyModule { module: token.to_string() });
        }

        Err(ConfigError::Invalid(format!(
            "'{}' is neither a file under {} nor a python module path",
            token,
            project_dir.display()
        )))
    }

    /// Classifies a token known to refer to a file.
    pub fn from_file_token(token: &str) -> Self {
        let path = PathBuf::from(token);
        if token.ends_with(".py") {
            Entrypoint::PyScript { path }
        } else {
            Entrypoint::Shell { path }
        }
    }

    /// The in-container command prefix plus target, without job arguments.
    pub fn command(&self) -> Vec<String> {
        match self {
            Entrypoint::PyModule { module } => {
                vec!["python".to_string(), "-m".to_string(), module.clone()]
            }
            Entrypoint::PyScript { path } => {
                vec!["python".to_string(), path.display().to_string()]
            }
            Entrypoint::Shell { path } => {
                vec!["/bin/bash".to_string(), path.display().to_string()]
            }
        }
    }

    /// The script or module token as the user supplied it.
    pub fn target(&self) -> String {
        match self {
            Entrypoint::PyModule { module } => module.clone(),
            Entrypoint::PyScript { path } | Entrypoint::Shell { path } => {
                path.display().to_string()
            }
        }
    }
}

fn is_dotted_module(s: &str) -> bool {
    !s.is_empty()
        && s.split('.').all(|seg| {
            let mut chars = seg.chars();
            match chars.next() {
                Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
                }
                _ => false,
            }
        })
}

/// A value that is either a single entry or a per-mode map with `cpu` and
/// `gpu` keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModeKeyed<T> {
    /// One value shared by every mode.
    Single(T),
    /// Distinct values per mode.
    PerMode {
        #[serde(default)]
        cpu: Option<T>,
        #[serde(default)]
        gpu: Option<T>,
    },
}

impl<T: Clone> ModeKeyed<T> {
    /// Picks the entry for the supplied mode. TPU mode reads the `cpu` key,
    /// matching the apt/extras behavior of the build planner.
    pub fn select(&self, mode: JobMode) -> Option<T> {
        match self {
            ModeKeyed::Single(v) => Some(v.clone()),
            ModeKeyed::PerMode { cpu, gpu } => {
                if mode.is_gpu() {
                    gpu.clone()
                } else {
                    cpu.clone()
                }
            }
        }
    }
}

/// Cloud SQL proxy settings injected into built images when present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudSqlProxyConfig {
    pub project: String,
    pub region: String,
    pub db: String,
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub artifact_root: Option<String>,
    #[serde(default)]
    pub debug: bool,
}

/// Parsed `.calibanconfig.json` document.
///
/// Unknown keys are ignored for forward compatibility.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Mode assumed when the invocation does not specify one.
    #[serde(default)]
    pub default_mode: Option<String>,

    /// Cloud project id used for image pushes and cloud submission.
    #[serde(default)]
    pub project_id: Option<String>,

    /// Path to a service account key copied into built images.
    #[serde(default)]
    pub cloud_key: Option<String>,

    /// Base image override: a single reference or a `{cpu, gpu}` map. A
    /// literal `{}` is replaced with the mode tag before short-form
    /// expansion.
    #[serde(default)]
    pub base_image: Option<ModeKeyed<String>>,

    /// Apt packages installed into the image: a flat list or a `{cpu, gpu}`
    /// map.
    #[serde(default)]
    pub apt_packages: Option<ModeKeyed<Vec<String>>>,

    /// Cloud SQL proxy configuration.
    #[serde(default)]
    pub cloud_sql_proxy: Option<CloudSqlProxyConfig>,

    /// Copy credentials into the image at build time.
    #[serde(default)]
    pub build_time_credentials: bool,
}

impl ProjectConfig {
    /// Loads the config document from a project directory.
    ///
    /// A missing file yields the default (empty) configuration; a present
    /// but malformed file is an error.
    pub fn load(project_dir: &Path) -> ConfigResult<Self> {
        let path = project_dir.join(PROJECT_CONFIG_FILE);
        if !path.is_file() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)?;
        let config: ProjectConfig = serde_json::from_str(&text)
            .map_err(|e| ConfigError::Invalid(format!("{}: {}", path.display(), e)))?;
        Ok(config)
    }

    /// Resolves the configured base image for a mode, if any.
    ///
    /// The `{}` placeholder in the configured string is spliced with the mode
    /// tag, and recognized `dlvm:` short forms expand to their canonical
    /// registry references.
    pub fn base_image(&self, mode: JobMode) -> Option<String> {
        self.base_image
            .as_ref()
            .and_then(|keyed| keyed.select(mode))
            .map(|image| expand_image(&image.replace("{}", mode.tag())))
    }

    /// The apt packages to install for a mode. TPU hosts share the CPU set.
    pub fn apt_packages(&self, mode: JobMode) -> Vec<String> {
        self.apt_packages
            .as_ref()
            .and_then(|keyed| keyed.select(mode))
            .unwrap_or_default()
    }
}

/// Deep Learning VM image families recognized in `dlvm:` short form, with
/// the versions published for each.
const DLVM_FAMILIES: &[(&str, &[&str])] = &[
    ("pytorch", &["1.0", "1.1", "1.2", "1.3", "1.4"]),
    ("tf", &["1.13", "1.14", "1.15"]),
    ("tf2", &["2.0", "2.1", "2.2"]),
];

const DLVM_ROOT: &str = "gcr.io/deeplearning-platform-release";

fn dlvm_table() -> &'static HashMap<String, String> {
    static TABLE: OnceLock<HashMap<String, String>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut m = HashMap::new();
        for (family, versions) in DLVM_FAMILIES {
            for version in *versions {
                for tag in ["cpu", "gpu"] {
                    let short = format!("dlvm:{}-{}-{}", family, tag, version);
                    let canonical =
                        format!("{}/{}-{}.{}", DLVM_ROOT, family, tag, version.replace('.', "-"));
                    m.insert(short, canonical);
                }
            }
        }
        m
    })
}

/// Expands a recognized `dlvm:` short-form image name into its canonical
/// registry reference. Unrecognized strings pass through unchanged.
pub fn expand_image(image: &str) -> String {
    dlvm_table().get(image).cloned().unwrap_or_else(|| image.to_string())
}

/// Name of the current user, for group naming and registry rows.
pub fn current_user() -> String {
    whoami::username()
}

/// Location of the registry database file.
///
/// Honors the `CALIBAN_DB_PATH` environment variable, falling back to
/// `<config-dir>/caliban/caliban.db`.
pub fn registry_db_path() -> PathBuf {
    if let Ok(path) = std::env::var(DB_PATH_ENV) {
        return PathBuf::from(path);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("caliban")
        .join("caliban.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_mode_parse() {
        assert_eq!(JobMode::parse("CpU").unwrap(), JobMode::Cpu);
        assert_eq!(JobMode::parse("gpu").unwrap(), JobMode::Gpu);
        assert_eq!(JobMode::parse("  GPU ").unwrap(), JobMode::Gpu);
        assert_eq!(JobMode::parse("tpu").unwrap(), JobMode::Tpu);
        assert!(JobMode::parse("random").is_err());
    }

    #[test]
    fn test_expand_image_known_and_unknown() {
        assert_eq!(
            expand_image("dlvm:tf2-gpu-2.2"),
            "gcr.io/deeplearning-platform-release/tf2-gpu.2-2"
        );
        assert_eq!(
            expand_image("dlvm:pytorch-cpu-1.4"),
            "gcr.io/deeplearning-platform-release/pytorch-cpu.1-4"
        );
        // Unknown references round-trip untouched.
        assert_eq!(expand_image("ubuntu:18.04"), "ubuntu:18.04");
        assert_eq!(expand_image("dlvm:nonexistent-cpu-9.9"), "dlvm:nonexistent-cpu-9.9");
    }

    #[test]
    fn test_base_image_splices_mode() {
        let config: ProjectConfig =
            serde_json::from_str(r#"{"base_image": "dlvm:pytorch-{}-1.4"}"#).unwrap();
        assert_eq!(
            config.base_image(JobMode::Cpu).unwrap(),
            "gcr.io/deeplearning-platform-release/pytorch-cpu.1-4"
        );
        assert_eq!(
            config.base_image(JobMode::Gpu).unwrap(),
            "gcr.io/deeplearning-platform-release/pytorch-gpu.1-4"
        );
    }

    #[test]
    fn test_base_image_per_mode_map() {
        let config: ProjectConfig = serde_json::from_str(
            r#"{"base_image": {"cpu": "dlvm:tf2-{}-2.1", "gpu": "random:latest"}}"#,
        )
        .unwrap();
        assert_eq!(
            config.base_image(JobMode::Cpu).unwrap(),
            "gcr.io/deeplearning-platform-release/tf2-cpu.2-1"
        );
        assert_eq!(config.base_image(JobMode::Gpu).unwrap(), "random:latest");
        assert!(config.base_image(JobMode::Tpu).is_some());
    }

    #[test]
    fn test_base_image_absent() {
        let config = ProjectConfig::default();
        assert!(config.base_image(JobMode::Cpu).is_none());
        assert!(config.base_image(JobMode::Gpu).is_none());
    }

    #[test]
    fn test_apt_packages_list_and_map() {
        let flat: ProjectConfig =
            serde_json::from_str(r#"{"apt_packages": ["git", "curl"]}"#).unwrap();
        assert_eq!(flat.apt_packages(JobMode::Cpu), vec!["git", "curl"]);
        assert_eq!(flat.apt_packages(JobMode::Gpu), vec!["git", "curl"]);

        let keyed: ProjectConfig =
            serde_json::from_str(r#"{"apt_packages": {"gpu": ["nvtop"], "cpu": ["htop"]}}"#)
                .unwrap();
        assert_eq!(keyed.apt_packages(JobMode::Gpu), vec!["nvtop"]);
        assert_eq!(keyed.apt_packages(JobMode::Cpu), vec!["htop"]);
        // TPU hosts share the CPU package set.
        assert_eq!(keyed.apt_packages(JobMode::Tpu), vec!["htop"]);
    }

    #[test]
    fn test_project_config_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProjectConfig::load(dir.path()).unwrap();
        assert_eq!(config, ProjectConfig::default());
    }

    #[test]
    fn test_project_config_rejects_malformed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PROJECT_CONFIG_FILE), "{not json").unwrap();
        assert!(ProjectConfig::load(dir.path()).is_err());
    }

    #[test]
    fn test_project_config_ignores_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(PROJECT_CONFIG_FILE),
            r#"{"project_id": "research-lab", "some_future_key": 42}"#,
        )
        .unwrap();
        let config = ProjectConfig::load(dir.path()).unwrap();
        assert_eq!(config.project_id.as_deref(), Some("research-lab"));
    }

    #[test]
    fn test_entrypoint_resolution() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("scripts")).unwrap();
        std::fs::write(dir.path().join("scripts/run.sh"), "#!/bin/bash\n").unwrap();
        std::fs::write(dir.path().join("train.py"), "").unwrap();

        assert_eq!(
            Entrypoint::resolve(dir.path(), "trainer.main").unwrap(),
            Entrypoint::PyModule { module: "trainer.main".to_string() }
        );
        assert_eq!(
            Entrypoint::resolve(dir.path(), "train.py").unwrap(),
            Entrypoint::PyScript { path: PathBuf::from("train.py") }
        );
        assert_eq!(
            Entrypoint::resolve(dir.path(), "scripts/run.sh").unwrap(),
            Entrypoint::Shell { path: PathBuf::from("scripts/run.sh") }
        );
        assert!(Entrypoint::resolve(dir.path(), "scripts/missing.sh").is_err());
    }

    #[test]
    fn test_entrypoint_command() {
        let module = Entrypoint::PyModule { module: "a.b.c".to_string() };
        assert_eq!(module.command(), vec!["python", "-m", "a.b.c"]);

        let script = Entrypoint::PyScript { path: PathBuf::from("train.py") };
        assert_eq!(script.command(), vec!["python", "train.py"]);

        let shell = Entrypoint::Shell { path: PathBuf::from("run.sh") };
        assert_eq!(shell.command(), vec!["/bin/bash", "run.sh"]);
    }
}
