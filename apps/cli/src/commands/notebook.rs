//! Notebook command: run a Jupyter server inside the built image.

use std::process::Stdio;

use caliban_core::build::{plan, BuildParams, DockerBuilder, DEFAULT_WORKDIR};
use caliban_core::config::{current_user, Entrypoint, JobMode, ProjectConfig};
use caliban_core::error::CalibanError;
use tracing::info;

use crate::commands::common::{project_dir, CliResult};

/// Execute the notebook command.
pub async fn execute(
    dir: Option<String>,
    mode: String,
    port: u16,
    classic: bool,
) -> CliResult {
    let project = project_dir(&dir)?;
    let mode = JobMode::parse(&mode)?;
    let config = ProjectConfig::load(&project)?;

    let params =
        BuildParams::new(&project, mode, Entrypoint::Shell { path: "/bin/bash".into() });
    let recipe = plan(&params, &config)?;
    let builder = DockerBuilder::new(false)?;
    let image = builder.build(&recipe, &params).await?;

    let frontend = if classic { "notebook" } else { "lab" };
    info!(image = %image, port, "starting jupyter {}", frontend);

    let mut args: Vec<String> = vec![
        "run".to_string(),
        "--rm".to_string(),
        "-it".to_string(),
        "--entrypoint".to_string(),
        "jupyter".to_string(),
        "-p".to_string(),
        format!("{}:{}", port, port),
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
    args.push(frontend.to_string());
    args.push("--ip=0.0.0.0".to_string());
    args.push(format!("--port={}", port));

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
