use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use spine_core::flow::{load_flow_file, Validation};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

mod config;

use config::{LogFormat, Services, SpineConfig};

#[derive(Parser, Debug)]
#[command(name = "spine")]
#[command(about = "Multi-agent flow execution engine", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "spine.toml", env = "SPINE_CONFIG")]
    config: PathBuf,

    /// Data directory for storage
    #[arg(short, long, default_value = "./data", env = "SPINE_DATA_DIR")]
    data_dir: PathBuf,

    /// Directory of flow files, overrides `orchestrator.flows_dir`
    #[arg(long, env = "SPINE_FLOWS_DIR")]
    flows_dir: Option<PathBuf>,

    /// Log output format, overrides `logging.format`
    #[arg(long, value_enum, env = "SPINE_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the orchestrator until interrupted (default)
    Run,
    /// Check a flow file and exit non-zero if it is invalid
    Validate {
        /// `.json` or `.toml` flow definition
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    match args.command {
        Some(Command::Validate { ref file }) => {
            init_tracing(args.log_format.unwrap_or_default());
            validate(file)
        }
        Some(Command::Run) | None => {
            let mut config = SpineConfig::load(&args.config, args.data_dir.clone())?;
            if let Some(flows_dir) = args.flows_dir.clone() {
                config.orchestrator.flows_dir = Some(flows_dir);
            }
            init_tracing(args.log_format.unwrap_or(config.logging.format));

            if !args.config.exists() {
                tracing::info!("Configuration file not found, using defaults");
            }
            run(config).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_tracing(format: LogFormat) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "spine=info,spine_core=info".into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run(config: SpineConfig) -> Result<()> {
    tracing::info!("Starting Spine");
    tracing::info!("Data directory: {}", config.data_dir.display());

    let services = Services::new(&config)?;

    let agents = services
        .directory
        .start()
        .await
        .context("Failed to start agent directory")?;
    let flows = services
        .orchestrator
        .start()
        .await
        .context("Failed to start orchestrator")?;
    tracing::info!(agents = agents, flows = flows, "Spine ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested");

    services.orchestrator.shutdown().await;
    services.directory.shutdown().await;

    Ok(())
}

/// Print the validation outcome of a flow file
fn validate(file: &Path) -> Result<ExitCode> {
    let validation = check_flow_file(file)?;
    println!("{}", serde_json::to_string_pretty(&validation)?);

    Ok(if validation.valid {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn check_flow_file(file: &Path) -> Result<Validation> {
    let flow = load_flow_file(file)?;
    Ok(Validation::of(&flow))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_check_flow_file() {
        let dir = TempDir::new().unwrap();

        let valid = dir.path().join("valid.toml");
        std::fs::write(
            &valid,
            r#"
flow_id = "credit"
name = "Credit"
entry_point = "intake"
exit_points = ["score"]

[[nodes]]
id = "intake"
type = "input"
agent_id = "collector"

[[nodes]]
id = "score"
type = "processor"
agent_id = "scorer"
depends_on = ["intake"]
"#,
        )
        .unwrap();
        assert!(check_flow_file(&valid).unwrap().valid);

        let cyclic = dir.path().join("cyclic.json");
        std::fs::write(
            &cyclic,
            serde_json::json!({
                "flow_id": "loop",
                "name": "Loop",
                "entry_point": "a",
                "nodes": [
                    {"id": "a", "type": "processor", "depends_on": ["b"]},
                    {"id": "b", "type": "processor", "depends_on": ["a"]}
                ]
            })
            .to_string(),
        )
        .unwrap();
        let outcome = check_flow_file(&cyclic).unwrap();
        assert!(!outcome.valid);
        assert!(outcome.reason.unwrap().contains("cycle"));

        assert!(check_flow_file(&dir.path().join("flow.yaml")).is_err());
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from(["spine", "--log-format", "json", "validate", "flow.toml"]).unwrap();
        assert_eq!(args.log_format, Some(LogFormat::Json));
        assert!(matches!(args.command, Some(Command::Validate { .. })));

        let args = Args::try_parse_from(["spine"]).unwrap();
        assert_eq!(args.config, PathBuf::from("spine.toml"));
        assert!(args.command.is_none());
    }
}
