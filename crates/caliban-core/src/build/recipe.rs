//! Build recipe planning.
//!
//! A [`BuildRecipe`] is an ordered list of layer directives plus the build
//! context manifest, sufficient to reproduce an image. Planning is pure and
//! deterministic: byte-identical inputs produce a byte-identical Dockerfile,
//! which keeps the external builder's layer cache effective.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::build::context::BuildContext;
use crate::build::error::{RecipeError, RecipeResult};
use crate::config::{Entrypoint, JobMode, ProjectConfig};

/// Default base images, one per mode family.
const DEV_CONTAINER_ROOT: &str = "gcr.io/blueshift-playground/blueshift";
const DEFAULT_CPU_TAG: &str = "cpu-ubuntu1804-py37";
const DEFAULT_GPU_TAG: &str = "gpu-ubuntu1804-py37-cuda101";

/// Fixed in-container locations.
pub const DEFAULT_WORKDIR: &str = "/usr/app";
pub const CREDS_DIR: &str = "/.creds";

/// Names under which the builder stages credential files into the context.
pub const STAGED_CREDENTIALS_FILE: &str = ".caliban_default_creds.json";
pub const STAGED_ADC_FILE: &str = ".caliban_adc_creds.json";

/// Inputs to the planner, resolved from the invocation and project config.
#[derive(Debug, Clone)]
pub struct BuildParams {
    pub project_dir: PathBuf,
    pub mode: JobMode,
    pub entrypoint: Entrypoint,
    /// Extra directories copied into the image, in user order.
    pub extra_dirs: Vec<String>,
    /// User-requested extras sets beyond the mode extra.
    pub setup_extras: Vec<String>,
    /// Service account key staged into the image, if any.
    pub credentials_path: Option<PathBuf>,
    /// Application-default credentials staged into the image, if any.
    pub adc_path: Option<PathBuf>,
    /// Host uid/gid mirrored into the container.
    pub uid: u32,
    pub gid: u32,
    pub username: String,
}

impl BuildParams {
    /// Parameters for a project directory with host identity filled in.
    pub fn new(project_dir: &Path, mode: JobMode, entrypoint: Entrypoint) -> Self {
        let (uid, gid) = host_uid_gid();
        Self {
            project_dir: project_dir.to_path_buf(),
            mode,
            entrypoint,
            extra_dirs: Vec::new(),
            setup_extras: Vec::new(),
            credentials_path: None,
            adc_path: None,
            uid,
            gid,
            username: crate::config::current_user(),
        }
    }
}

/// Identity and location facts shared by every rendered layer.
#[derive(Debug, Clone)]
struct RenderContext {
    uid: u32,
    gid: u32,
    username: String,
    workdir: String,
    home: String,
}

impl RenderContext {
    fn copy(&self, from: &str, to: &str) -> String {
        format!("COPY --chown={}:{} {} {}\n", self.uid, self.gid, from, to)
    }
}

/// One ordered step of the build recipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerDirective {
    /// Base image selection.
    From { image: String },
    /// Host uid/gid mirroring, workdir and home scaffolding.
    UserSetup,
    /// System package installation, sorted and deduplicated.
    AptPackages { packages: Vec<String> },
    /// Service account key under the fixed credentials dir.
    ServiceAccountKey,
    /// Application-default credentials in the container home.
    AdcCredentials,
    /// Cloud SQL proxy binary fetch.
    CloudSqlProxy,
    /// Copy of a dependency declaration file into the workdir.
    CopyDependencyFile { file: String },
    /// `pip install .[extras]` against a setup descriptor.
    PipInstallSetup { extras: Vec<String> },
    /// `pip install -r` against a requirements file.
    PipInstallRequirements { file: String },
    /// Copy of a source directory into the workdir.
    CopySource { dir: String },
    /// Copy of one user-listed extra directory.
    CopyExtraDir { dir: String },
    /// Container entrypoint.
    SetEntrypoint { command: Vec<String> },
}

impl LayerDirective {
    fn render(&self, ctx: &RenderContext) -> String {
        match self {
            LayerDirective::From { image } => format!("FROM {}\n", image),

            LayerDirective::UserSetup => format!(
                "\nRUN [ $(getent group {gid}) ] || groupadd --gid {gid} {gid}\n\
                 RUN useradd --no-log-init --no-create-home -u {uid} -g {gid} \
                 --shell /bin/bash {username}\n\
                 RUN mkdir -m 777 {workdir} {creds} {home}\n\
                 ENV HOME={home}\n\
                 WORKDIR {workdir}\n\
                 USER {uid}:{gid}\n",
                uid = ctx.uid,
                gid = ctx.gid,
                username = ctx.username,
                workdir = ctx.workdir,
                creds = CREDS_DIR,
                home = ctx.home,
            ),

            LayerDirective::AptPackages { packages } => {
                if packages.is_empty() {
                    return String::new();
                }
                format!(
                    "\nUSER root\n\
                     RUN apt-get update && \
                     DEBIAN_FRONTEND=noninteractive apt-get install --yes \
                     --no-install-recommends {} && \
                     apt-get clean && rm -rf /var/lib/apt/lists/*\n\
                     USER {}:{}\n",
                    packages.join(" "),
                    ctx.uid,
                    ctx.gid,
                )
            }

            LayerDirective::ServiceAccountKey => {
                let target = format!("{}/credentials.json", CREDS_DIR);
                format!(
                    "\n{}ENV GOOGLE_APPLICATION_CREDENTIALS={}\n",
                    ctx.copy(STAGED_CREDENTIALS_FILE, &target),
                    target,
                )
            }

            LayerDirective::AdcCredentials => {
                let target = format!(
                    "{}/.config/gcloud/application_default_credentials.json",
                    ctx.home
                );
                format!("\n{}", ctx.copy(STAGED_ADC_FILE, &target))
            }

            LayerDirective::CloudSqlProxy => format!(
                "\nUSER root\n\
                 RUN wget -q https://dl.google.com/cloudsql/cloud_sql_proxy.linux.amd64 \
                 -O /usr/bin/cloud_sql_proxy && chmod 755 /usr/bin/cloud_sql_proxy\n\
                 USER {}:{}\n",
                ctx.uid, ctx.gid,
            ),

            LayerDirective::CopyDependencyFile { file } => {
                format!("\n{}", ctx.copy(file, &ctx.workdir))
            }

            LayerDirective::PipInstallSetup { extras } => {
                let target = if extras.is_empty() {
                    ".".to_string()
                } else {
                    format!(".[{}]", extras.join(","))
                };
                format!(
                    "RUN /bin/bash -c \"pip install --no-cache-dir {}\"\n",
                    target
                )
            }

            LayerDirective::PipInstallRequirements { file } => format!(
                "RUN /bin/bash -c \"pip install --no-cache-dir -r {}\"\n",
                file
            ),

            LayerDirective::CopySource { dir } => {
                let target = if dir == "." {
                    ctx.workdir.clone()
                } else {
                    format!("{}/{}", ctx.workdir, dir)
                };
                format!("\n{}", ctx.copy(dir, &target))
            }

            LayerDirective::CopyExtraDir { dir } => {
                format!("\n{}", ctx.copy(dir, &format!("{}/{}", ctx.workdir, dir)))
            }

            LayerDirective::SetEntrypoint { command } => {
                let json = serde_json::to_string(command).expect("argv serializes");
                format!("\nENTRYPOINT {}\n", json)
            }
        }
    }
}

/// A deterministic, ordered description of layers and build context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRecipe {
    pub layers: Vec<LayerDirective>,
    pub context: BuildContext,
    render: RenderParams,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RenderParams {
    uid: u32,
    gid: u32,
    username: String,
}

impl BuildRecipe {
    /// Renders the recipe into Dockerfile text. Byte-identical for
    /// byte-identical planner inputs.
    pub fn dockerfile(&self) -> String {
        let ctx = RenderContext {
            uid: self.render.uid,
            gid: self.render.gid,
            username: self.render.username.clone(),
            workdir: DEFAULT_WORKDIR.to_string(),
            home: format!("/home/{}", self.render.username),
        };
        self.layers.iter().map(|layer| layer.render(&ctx)).collect()
    }
}

/// The default base image for a mode. TPU hosts run the CPU image family.
pub fn default_base_image(mode: JobMode) -> String {
    let tag = if mode.is_gpu() { DEFAULT_GPU_TAG } else { DEFAULT_CPU_TAG };
    format!("{}:{}", DEV_CONTAINER_ROOT, tag)
}

/// Plans the build recipe for a project.
///
/// Layer order, from the base outward: base image, user scaffolding, apt
/// packages, credentials, cloud SQL proxy, dependency files and install,
/// project source, extra directories (user order), entrypoint.
pub fn plan(params: &BuildParams, config: &ProjectConfig) -> RecipeResult<BuildRecipe> {
    for dir in &params.extra_dirs {
        if !params.project_dir.join(dir).is_dir() {
            return Err(RecipeError::MissingDirectory(dir.clone()));
        }
    }

    let context = BuildContext::enumerate(&params.project_dir)?;
    let mut layers = Vec::new();

    let base = config
        .base_image(params.mode)
        .unwrap_or_else(|| default_base_image(params.mode));
    layers.push(LayerDirective::From { image: base });
    layers.push(LayerDirective::UserSetup);

    let mut packages = config.apt_packages(params.mode);
    packages.sort();
    packages.dedup();
    layers.push(LayerDirective::AptPackages { packages });

    if params.credentials_path.is_some() {
        layers.push(LayerDirective::ServiceAccountKey);
    }
    if params.adc_path.is_some() {
        layers.push(LayerDirective::AdcCredentials);
    }
    if config.cloud_sql_proxy.is_some() {
        layers.push(LayerDirective::CloudSqlProxy);
    }

    let has_setup = params.project_dir.join("setup.py").is_file();
    let has_requirements = params.project_dir.join("requirements.txt").is_file();

    if has_setup {
        let mode_extra = params.mode.tag().to_string();
        let mut extras = Vec::new();
        if !params.setup_extras.contains(&mode_extra) {
            extras.push(mode_extra);
        }
        extras.extend(params.setup_extras.iter().cloned());
        layers.push(LayerDirective::CopyDependencyFile { file: "setup.py".to_string() });
        layers.push(LayerDirective::PipInstallSetup { extras });
    } else if !params.setup_extras.is_empty() {
        warn!(
            extras = ?params.setup_extras,
            "extras requested but no setup.py found; skipping extras install"
        );
    }

    if has_requirements {
        layers.push(LayerDirective::CopyDependencyFile {
            file: "requirements.txt".to_string(),
        });
        layers.push(LayerDirective::PipInstallRequirements {
            file: "requirements.txt".to_string(),
        });
    }

    layers.push(LayerDirective::CopySource { dir: source_root(&params.entrypoint) });

    for dir in &params.extra_dirs {
        layers.push(LayerDirective::CopyExtraDir { dir: dir.clone() });
    }

    layers.push(LayerDirective::SetEntrypoint { command: params.entrypoint.command() });

    Ok(BuildRecipe {
        layers,
        context,
        render: RenderParams {
            uid: params.uid,
            gid: params.gid,
            username: params.username.clone(),
        },
    })
}

/// The top-level directory that must be copied for an entrypoint to run:
/// the first path component of the script, or the module's root package.
fn source_root(entrypoint: &Entrypoint) -> String {
    let path = match entrypoint {
        Entrypoint::PyModule { module } => module.replace('.', "/") + ".py",
        Entrypoint::PyScript { path } | Entrypoint::Shell { path } => {
            path.display().to_string()
        }
    };
    match path.split('/').next() {
        Some(root) if path.contains('/') => root.to_string(),
        _ => ".".to_string(),
    }
}

/// The host uid/gid mirrored into built images so bind mounts stay writable.
#[cfg(unix)]
pub fn host_uid_gid() -> (u32, u32) {
    use std::os::unix::fs::MetadataExt;
    dirs::home_dir()
        .and_then(|home| std::fs::metadata(home).ok())
        .map(|meta| (meta.uid(), meta.gid()))
        .unwrap_or((1000, 1000))
}

#[cfg(not(unix))]
pub fn host_uid_gid() -> (u32, u32) {
    (1000, 1000)
}
