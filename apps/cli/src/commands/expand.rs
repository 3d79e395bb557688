//! Expand-experiments command: print the argv of every job a config
//! expands into, one line each, without touching Docker or the registry.

use crate::commands::common::{load_experiment_config, CliResult};

/// Execute the expand-experiments command.
pub async fn execute(experiment_config: String, script_args: Vec<String>) -> CliResult {
    let prefix = match script_args.first() {
        Some(first) if first == "--" => script_args[1..].to_vec(),
        _ => script_args,
    };

    let config = load_experiment_config(&Some(experiment_config))?
        .expect("source is always present here");

    for tuple in config.expand() {
        println!("{}", tuple.to_args(&prefix).join(" "));
    }
    Ok(0)
}
