//! shipgate - build/release orchestration CLI
//!
//! Each command runs one stage of the release pipeline together with every
//! stage it depends on. Up-to-date stages are skipped.
//!
//! ## Commands
//!
//! - `version`: resolve and persist the release version
//! - `plan`: print the execution order for one or more tasks
//! - `assemble`: build the versioned bundle with its legal metadata
//! - `containerize`: build the service image from the bundle
//! - `test-integration`: start the container and run the black-box suite
//! - `evaluate-gates`: coverage, license and vulnerability gates
//! - `publish`: release the bundle and image once every gate passed
//! - `run`: the full pipeline
//!
//! The process exit code identifies the failing stage; see
//! [`ShipgateError::exit_code`].

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, Level};

use shipgate_core::{
    render_run_summary_md, tasks, write_run_summary_json, Pipeline, PipelineConfig,
    PipelineServices, RunSummaryArtifact, ShipgateError, DEFAULT_CONFIG_FILE,
};

#[derive(Parser)]
#[command(name = "shipgate")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build/release orchestration: assemble, containerize, test, gate, publish")]
struct Cli {
    /// Pipeline configuration file
    #[arg(short, long, global = true, env = "SHIPGATE_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines and machine-readable command output
    #[arg(long, global = true)]
    json: bool,

    /// Ignore up-to-date checks and run every task
    #[arg(long, global = true)]
    rerun: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Commands {
    /// Resolve the next release version and persist it
    Version,

    /// Print the execution order for the given tasks without running them
    Plan {
        /// Task names (default: the full pipeline)
        targets: Vec<String>,
    },

    /// Remove generated bundles and reports
    Clean,

    /// Assemble the versioned bundle
    Assemble,

    /// Build the service image
    Containerize,

    /// Start the service container and run the integration suite
    TestIntegration,

    /// Evaluate the release gates
    EvaluateGates,

    /// Publish the release (requires passing gates)
    Publish,

    /// Run the full pipeline
    Run,
}

impl Commands {
    /// Graph targets for a stage command.
    fn targets(&self) -> Vec<&str> {
        match self {
            Commands::Version => vec![tasks::RESOLVE_VERSION],
            Commands::Plan { targets } if targets.is_empty() => full_pipeline(),
            Commands::Plan { targets } => targets.iter().map(String::as_str).collect(),
            Commands::Clean => vec![tasks::CLEAN],
            Commands::Assemble => vec![tasks::ASSEMBLE],
            Commands::Containerize => vec![tasks::BUILD_IMAGE],
            Commands::TestIntegration => vec![tasks::TEST_INTEGRATION],
            Commands::EvaluateGates => vec![tasks::EVALUATE_GATES],
            Commands::Publish => vec![tasks::PUBLISH],
            Commands::Run => full_pipeline(),
        }
    }
}

fn full_pipeline() -> Vec<&'static str> {
    vec![tasks::PUBLISH, tasks::TEST_INTEGRATION]
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    shipgate_core::init_tracing(cli.json, level);

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!(error = %format!("{err:#}"), "shipgate failed");
            eprintln!("error: {err:#}");
            ExitCode::from(ShipgateError::exit_code_of(&err))
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let config = PipelineConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let config = Arc::new(config);
    let services = PipelineServices::production(&config)?;
    let pipeline = Pipeline::new(Arc::clone(&config), services)?;
    info!(
        run_id = %pipeline.run_id(),
        version = %pipeline.version().version,
        "pipeline configured"
    );

    match &cli.command {
        Commands::Plan { .. } => cmd_plan(&pipeline, &cli.command.targets(), cli.json),
        command => {
            let code = cmd_execute(&pipeline, &command.targets(), cli.rerun).await?;
            if *command == Commands::Version && code == 0 {
                print_version(&pipeline, cli.json)?;
            }
            Ok(code)
        }
    }
}

fn cmd_plan(pipeline: &Pipeline, targets: &[&str], json: bool) -> Result<u8> {
    let plan = pipeline.graph().plan(targets)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(0);
    }
    for (i, task) in plan.order.iter().enumerate() {
        let marker = if plan.finalizer_only.contains(task) {
            "  (finalizer)"
        } else {
            ""
        };
        println!("{:>2}. {task}{marker}", i + 1);
    }
    Ok(0)
}

async fn cmd_execute(pipeline: &Pipeline, targets: &[&str], rerun: bool) -> Result<u8> {
    let report = pipeline.execute(targets, rerun).await?;
    let summary = RunSummaryArtifact::from_report(&report, &pipeline.version().version.to_string());

    let path = pipeline.config().report_path("run-summary.json");
    if let Err(e) = write_run_summary_json(&path, &summary) {
        error!(error = %format!("{e:#}"), "could not write run summary");
    }
    print!("{}", render_run_summary_md(&summary));

    for (task, outcome) in report.failures() {
        error!(task = %task, outcome = ?outcome, "task failed");
    }
    Ok(report.exit_code())
}

fn print_version(pipeline: &Pipeline, json: bool) -> Result<()> {
    let resolved = pipeline.version();
    if json {
        println!("{}", serde_json::to_string_pretty(resolved)?);
    } else {
        println!("{}", resolved.version);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn stage_commands_map_to_graph_targets() {
        let cli = Cli::try_parse_from(["shipgate", "containerize"]).unwrap();
        assert_eq!(cli.command.targets(), vec![tasks::BUILD_IMAGE]);

        let cli = Cli::try_parse_from(["shipgate", "--rerun", "run"]).unwrap();
        assert!(cli.rerun);
        assert_eq!(cli.command.targets(), vec![tasks::PUBLISH, tasks::TEST_INTEGRATION]);

        let cli = Cli::try_parse_from(["shipgate", "evaluate-gates", "--json"]).unwrap();
        assert!(cli.json);
        assert_eq!(cli.command.targets(), vec![tasks::EVALUATE_GATES]);
    }

    #[test]
    fn plan_defaults_to_full_pipeline() {
        let cli = Cli::try_parse_from(["shipgate", "plan"]).unwrap();
        assert_eq!(cli.command.targets(), full_pipeline());

        let cli = Cli::try_parse_from(["shipgate", "plan", "assemble", "clean"]).unwrap();
        assert_eq!(cli.command.targets(), vec!["assemble", "clean"]);
    }

    #[test]
    fn config_flag_defaults_to_shipgate_toml() {
        let cli = Cli::try_parse_from(["shipgate", "-c", "ci/release.toml", "publish"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("ci/release.toml"));
        assert_eq!(cli.command, Commands::Publish);
    }

    #[tokio::test]
    async fn missing_config_exits_with_config_code() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::try_parse_from([
            "shipgate",
            "--config",
            dir.path().join("absent.toml").to_str().unwrap(),
            "assemble",
        ])
        .unwrap();
        let err = run(cli).await.unwrap_err();
        assert_eq!(ShipgateError::exit_code_of(&err), 60);
    }
}
