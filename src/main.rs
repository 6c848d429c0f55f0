/// geoflow command line
///
/// - `geoflow run <file>` runs a pipeline document and prints its Run Report
/// - `geoflow modules` prints the registered stage types
/// - `geoflow serve` starts the HTTP server
use anyhow::Result;
use clap::{Parser, Subcommand};
use geoflow::{
    config::Config,
    pipeline::{Environment, PipelineDocument},
    server::{build_engine, init_tracing, start_server},
    RunStatus,
};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "geoflow", version, about = "Declarative geospatial pipeline engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a pipeline document
    Run {
        /// Pipeline document (JSON, comments allowed)
        file: PathBuf,
        /// Run variable, NAME=VALUE
        #[arg(long = "var", value_name = "NAME=VALUE")]
        vars: Vec<String>,
        /// Stage parameter override, stageId.param=value
        #[arg(long = "set", value_name = "STAGE.PARAM=VALUE")]
        overrides: Vec<String>,
    },
    /// Print the module catalogue as JSON
    Modules,
    /// Start the HTTP server
    Serve,
}

fn parse_vars(vars: &[String]) -> Result<Environment> {
    vars.iter()
        .map(|var| {
            var.split_once('=')
                .map(|(name, value)| (name.trim().to_string(), value.to_string()))
                .ok_or_else(|| anyhow::anyhow!("Variable '{}' must look like NAME=VALUE", var))
        })
        .collect::<Result<Vec<_>>>()
        .map(|pairs| pairs.into_iter().collect())
}

fn run(config: &Config, file: PathBuf, vars: Vec<String>, overrides: Vec<String>) -> Result<ExitCode> {
    let mut document = PipelineDocument::from_file(&file)?;
    for expr in &overrides {
        document.apply_override_expr(expr)?;
    }
    let env = parse_vars(&vars)?;

    let report = build_engine(config).run_pipeline(&document, &env);
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(match report.status() {
        RunStatus::Ok => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    let config = Config::default();

    match cli.command {
        Command::Run { file, vars, overrides } => {
            tokio::task::spawn_blocking(move || run(&config, file, vars, overrides)).await?
        }
        Command::Modules => {
            let modules = build_engine(&config).list_modules();
            println!("{}", serde_json::to_string_pretty(&modules)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Serve => {
            start_server(config).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
