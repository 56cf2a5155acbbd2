use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use gauntlet_core::broadcast::LogBroadcaster;
use gauntlet_core::config::{list_input_files, GauntletConfig};
use gauntlet_core::orchestrator::Orchestrator;
use gauntlet_core::runner::TestResult;

#[derive(Parser)]
#[command(name = "gauntlet", version, about = "Batch harness for an analysis CLI")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full batch over all configured repositories.
    Run {
        /// Path to gauntlet.toml (defaults to ./gauntlet.toml).
        #[arg(long)]
        config: Option<PathBuf>,
        /// Output the complete result list as JSON instead of a summary.
        #[arg(long)]
        json: bool,
    },
    /// List the input files discovered for each configured repository.
    Inputs {
        /// Path to gauntlet.toml (defaults to ./gauntlet.toml).
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gauntlet_core=info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Command::Run { config, json }) => run_batch(config.as_deref(), json).await,
        Some(Command::Inputs { config }) => list_inputs(config.as_deref()),
        None => {
            println!("gauntlet v0.1.0");
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<GauntletConfig> {
    match path {
        Some(path) => GauntletConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(GauntletConfig::load_or_default()),
    }
}

async fn run_batch(config_path: Option<&std::path::Path>, json_output: bool) -> Result<ExitCode> {
    let config = load_config(config_path)?;
    if config.repos.is_empty() {
        anyhow::bail!("no repositories configured; nothing to run");
    }

    let orchestrator = Orchestrator::new(config, LogBroadcaster::new());
    let results = orchestrator.run_all().await;

    if json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(&results).expect("serialize results")
        );
    } else {
        print_summary(&results);
    }

    if results.iter().all(|r| r.success) && !results.is_empty() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(1))
    }
}

fn print_summary(results: &[TestResult]) {
    println!("Batch Summary");
    println!("=============");

    for result in results {
        let icon = if result.success { "\u{2713}" } else { "\u{2717}" };
        let error_part = result
            .error
            .as_deref()
            .map(|e| format!(" -- {e}"))
            .unwrap_or_default();
        println!(
            "{icon} {} / {} run {} ({:.1}s){error_part}",
            result.repo, result.input_file, result.run_number, result.duration_secs
        );
    }

    let passed = results.iter().filter(|r| r.success).count();
    println!();
    println!("{passed}/{} passed", results.len());
}

fn list_inputs(config_path: Option<&std::path::Path>) -> Result<ExitCode> {
    let config = load_config(config_path)?;

    for repo in &config.repos {
        match list_input_files(&repo.inputs_path) {
            Ok(files) => {
                println!("{}: {} input file(s)", repo.repo_name(), files.len());
                for file in files {
                    println!("  {file}");
                }
            }
            Err(e) => {
                println!("{}: cannot list inputs ({e})", repo.repo_name());
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
