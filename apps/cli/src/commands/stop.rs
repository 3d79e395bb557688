//! Stop command: cancel the running jobs of an experiment group.

use std::io::{BufRead, Write};

use caliban_core::status;
use colored::Colorize;

use crate::commands::common::{adapter_set, open_store, CliResult};

/// Execute the stop command.
///
/// Stopping a large sweep can take a while, so the user confirms up front
/// rather than after the candidate query returns.
pub async fn execute(xgroup: String, dry_run: bool) -> CliResult {
    if !dry_run && !confirm("Warning: this will potentially stop many jobs, continue? [y/N] ") {
        return Ok(0);
    }

    let mut store = open_store()?;
    let adapters = adapter_set();
    let report = status::stop(&mut store, &adapters, &xgroup, dry_run).await?;

    if dry_run {
        if report.requested.is_empty() {
            println!("no running jobs found in xgroup {}", xgroup.bold());
        } else {
            println!("the following jobs would be stopped:");
            for job in &report.requested {
                println!("  job {} ({}, {})", job.id, job.backend_handle, job.status);
            }
            println!("re-run without --dry_run to stop them");
        }
        return Ok(0);
    }

    for job in &report.requested {
        println!("stop requested for job {} ({})", job.id, job.backend_handle);
    }
    for job in &report.no_change {
        println!(
            "{} job {} ({}) left unchanged: {}",
            "no-op:".dimmed(),
            job.id,
            job.backend_handle,
            job.status,
        );
    }
    if !report.requested.is_empty() {
        println!(
            "requested job cancellation; it may take a short while for the status \
             change to show up in `caliban status`"
        );
    }
    Ok(0)
}

fn confirm(prompt: &str) -> bool {
    print!("{}", prompt);
    let _ = std::io::stdout().flush();
    let mut line = String::new();
    if std::io::stdin().lock().read_line(&mut line).is_err() {
        return false;
    }
    matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
