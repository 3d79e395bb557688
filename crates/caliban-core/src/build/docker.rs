//! Driving the external Docker builder.
//!
//! The planner produces a recipe; this module hands it to `docker build`
//! over stdin, stages credential files into the build context for the
//! duration of the build, and parses the resulting image id.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

use crate::build::error::{RecipeError, RecipeResult};
use crate::build::recipe::{BuildParams, BuildRecipe, STAGED_ADC_FILE, STAGED_CREDENTIALS_FILE};

/// Builder that produces images with the local Docker daemon.
pub struct DockerBuilder {
    no_cache: bool,
}

impl DockerBuilder {
    /// Creates a builder, verifying that Docker is available on the host.
    ///
    /// # Errors
    /// `RecipeError::BuildFailed` if the `docker` binary cannot be invoked.
    pub fn new(no_cache: bool) -> RecipeResult<Self> {
        std::process::Command::new("docker").arg("--version").output().map_err(|e| {
            RecipeError::BuildFailed { code: -1, stderr: format!("Docker not found: {}", e) }
        })?;
        Ok(Self { no_cache })
    }

    /// Builds the recipe into an image and returns its id.
    ///
    /// The rendered Dockerfile is piped over stdin (`-f-`), so nothing but
    /// the staged credential copies touches the project directory.
    pub async fn build(
        &self,
        recipe: &BuildRecipe,
        params: &BuildParams,
    ) -> RecipeResult<String> {
        let _staged = StagedCredentials::stage(params)?;

        let mut args: Vec<String> = vec!["build".to_string()];
        if self.no_cache {
            args.push("--no-cache".to_string());
        }
        args.push("--rm".to_string());
        args.push("-f-".to_string());
        args.push(recipe.context.root.display().to_string());

        debug!(?args, "running docker build");
        let mut child = Command::new("docker")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let dockerfile = recipe.dockerfile();
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(dockerfile.as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(RecipeError::BuildFailed {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let image_id = parse_image_id(&stdout)?;
        info!(image = %image_id, "image built");
        Ok(image_id)
    }

    /// Tags the image under the project's registry with a fresh UUID tag and
    /// pushes it, returning the pushed reference.
    pub async fn push(&self, project_id: &str, image_id: &str) -> RecipeResult<String> {
        let tag = format!("gcr.io/{}/{}:latest", project_id, Uuid::new_v4().simple());

        let output = Command::new("docker").args(["tag", image_id, &tag]).output().await?;
        if !output.status.success() {
            return Err(RecipeError::BuildFailed {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let output = Command::new("docker").args(["push", &tag]).output().await?;
        if !output.status.success() {
            return Err(RecipeError::BuildFailed {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        info!(%tag, "image pushed");
        Ok(tag)
    }
}

/// Parses the image id from `docker build` output: the last token of the
/// last non-empty line (`Successfully built <id>`).
fn parse_image_id(output: &str) -> RecipeResult<String> {
    output
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .and_then(|line| line.split_whitespace().last())
        .map(|id| id.to_string())
        .ok_or(RecipeError::UnparseableOutput)
}

/// Credential files copied into the build context for the duration of a
/// build, removed again when dropped.
struct StagedCredentials {
    staged: Vec<PathBuf>,
}

impl StagedCredentials {
    fn stage(params: &BuildParams) -> RecipeResult<Self> {
        let mut staged = Vec::new();
        let pairs = [
            (&params.credentials_path, STAGED_CREDENTIALS_FILE),
            (&params.adc_path, STAGED_ADC_FILE),
        ];
        for (source, name) in pairs {
            if let Some(source) = source {
                let target = params.project_dir.join(name);
                copy_into_context(source, &target)?;
                staged.push(target);
            }
        }
        Ok(Self { staged })
    }
}

fn copy_into_context(source: &Path, target: &Path) -> RecipeResult<()> {
    if !source.is_file() {
        return Err(RecipeError::MissingFile(source.display().to_string()));
    }
    std::fs::copy(source, target)?;
    Ok(())
}

impl Drop for StagedCredentials {
    fn drop(&mut self) {
        for path in &self.staged {
            let _ = std::fs::remove_file(path);
        }
    }
}
