//! Shell command: open an interactive shell inside the built image.

use std::process::Stdio;

use caliban_core::build::{plan, BuildParams, DockerBuilder, DEFAULT_WORKDIR};
use caliban_core::config::{current_user, Entrypoint, JobMode, ProjectConfig};
use caliban_core::error::CalibanError;
use tracing::info;

use crate::commands::common::{project_dir, CliResult};

/// Execute the shell command.
///
/// Builds the project image (unless one is supplied) and drops into bash
/// with the project directory and home directory mounted, so the container
/// environment matches what a submitted job sees.
pub async fn execute(dir: Option<String>, mode: String, image: Option<String>) -> CliResult {
    let project = project_dir(&dir)?;
    let mode = JobMode::parse(&mode)?;

    let image = match image {
        Some(image) => image,
        None => {
            let config = ProjectConfig::load(&project)?;
            // The shell doesn't execute a module; a placeholder entrypoint
            // keeps the recipe well-formed and is overridden below.
            let params = BuildParams::new(
                &project,
                mode,
                Entrypoint::Shell { path: "/bin/bash".into() },
            );
            let recipe = plan(&params, &config)?;
            let builder = DockerBuilder::new(false)?;
            builder.build(&recipe, &params).await?
        }
    };

    info!(image = %image, "starting interactive shell");
    let mut args: Vec<String> = vec![
        "run".to_string(),
        "--rm".to_string(),
        "-it".to_string(),
        "--entrypoint".to_string(),
        "/bin/bash".to_string(),
    ];
    if mode.is_gpu() {
        args.push("--runtime".to_string());
        args.push("nvidia".to_string());
    }
    args.push("-v".to_string());
    args.push(format!("{}:{}", project.display(), DEFAULT_WORKDIR));
    if let Some(home) = dirs::home_dir() {
        args.push("-v".to_string());
        args.push(format!("{}:/home/{}", home.display(), current_user()));
    }
    args.push(image);

    let status = tokio::process::Command::new("docker")
        .args(&args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await
        .map_err(CalibanError::Io)?;

    Ok(status.code().unwrap_or(1))
}
