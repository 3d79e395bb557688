//! Status command: grouped views of recent jobs or one experiment group.

use caliban_core::registry::{GroupView, Job, JobStatus};
use caliban_core::status;
use colored::Colorize;

use crate::commands::common::{adapter_set, open_store, CliResult};

/// Jobs shown by default for `caliban status` with no group.
const DEFAULT_RECENT_JOBS: usize = 8;

/// Execute the status command.
pub async fn execute(xgroup: Option<String>, max_jobs: Option<usize>) -> CliResult {
    let mut store = open_store()?;
    let adapters = adapter_set();

    match xgroup {
        Some(name) => {
            match status::group(&mut store, &adapters, &name, max_jobs.or(Some(1))).await? {
                Some(view) => display_view(&view),
                None => println!("xgroup {} not found", name.bold()),
            }
        }
        None => {
            let limit = max_jobs.unwrap_or(DEFAULT_RECENT_JOBS);
            let views = status::recent(&mut store, &adapters, limit).await?;
            if views.is_empty() {
                println!("no recent jobs found");
            } else {
                println!("most recent {} jobs:\n", limit);
                for view in &views {
                    display_view(view);
                }
            }
        }
    }
    Ok(0)
}

fn display_view(view: &GroupView) {
    println!("xgroup {}:", view.group.name.bold());
    for container_view in &view.containers {
        let container = &container_view.container;
        println!(
            "docker config {}: mode: {}, build url: {}, extra dirs: {:?}",
            container.id,
            container.mode,
            container.build_context_path,
            container.extra_dirs,
        );
        for experiment_view in &container_view.experiments {
            let experiment = &experiment_view.experiment;
            println!(
                "  experiment id {}: {}",
                experiment.id,
                experiment.command_string()
            );
            if experiment_view.jobs.is_empty() {
                println!("    no jobs found");
            }
            for job in &experiment_view.jobs {
                println!("    job {}", job_line(job));
            }
        }
    }
    println!();
}

fn job_line(job: &Job) -> String {
    let status = colored_status(job.status);
    let created = job.created_at.format("%Y-%m-%d %H:%M:%S");
    let container = job
        .details
        .get("container")
        .and_then(|v| v.as_str())
        .unwrap_or("<unknown>");
    format!(
        "{:<8} {:9} {:>8} {} container: {} name: {}",
        job.id,
        status,
        job.backend.to_string(),
        created,
        container,
        job.backend_handle,
    )
}

fn colored_status(status: JobStatus) -> String {
    let text = status.to_string();
    match status {
        JobStatus::Succeeded => text.green().to_string(),
        JobStatus::Failed => text.red().to_string(),
        JobStatus::Running => text.yellow().to_string(),
        JobStatus::Stopped => text.magenta().to_string(),
        JobStatus::Submitted => text.cyan().to_string(),
        JobStatus::Unknown => text.dimmed().to_string(),
    }
}
