//! Chengis CLI: master server, agent, trigger, validate.
//!
//! Exit codes: 0 success, 1 command error, 2 configuration error,
//! 3 database error.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use chengis_agent::{AgentConfig, AgentWorker};
use chengis_config::SystemConfig;

const EXIT_COMMAND: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_DATABASE: u8 = 3;

#[derive(Parser)]
#[command(name = "chengis")]
#[command(about = "Chengis CI engine", long_about = None)]
struct Cli {
    /// Path to the system configuration file
    #[arg(long, env = "CHENGIS_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the master server
    Server {
        /// Override the configured bind address
        #[arg(long)]
        bind: Option<String>,
    },
    /// Run a build agent
    Agent {
        /// Master base URL
        #[arg(long, env = "CHENGIS_MASTER_URL")]
        master_url: String,
        /// Agent name (unique per master)
        #[arg(long)]
        name: String,
        /// Bind address for the agent's HTTP endpoint
        #[arg(long, default_value = "0.0.0.0:9090")]
        bind: String,
        /// URL the master should dispatch builds to
        #[arg(long)]
        advertise_url: Option<String>,
        /// Labels this agent offers (repeatable)
        #[arg(long = "label")]
        labels: Vec<String>,
        /// Concurrent build limit
        #[arg(long, default_value = "2")]
        max_builds: u32,
        /// Workspace root directory
        #[arg(long, default_value = "/var/lib/chengis/agent")]
        workspace: PathBuf,
        /// Region hint for scheduling
        #[arg(long)]
        region: Option<String>,
    },
    /// Trigger a job on a running master
    Trigger {
        /// Master base URL
        #[arg(long, env = "CHENGIS_MASTER_URL", default_value = "http://localhost:8080")]
        master_url: String,
        /// Job name
        job: String,
        /// Branch to build
        #[arg(long)]
        branch: Option<String>,
        /// Parameters as key=value (repeatable)
        #[arg(long = "param")]
        parameters: Vec<String>,
    },
    /// Validate a pipeline definition file
    Validate {
        /// Path to chengis.json / chengis.yaml
        #[arg(default_value = "chengis.json")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match SystemConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match cli.command {
        Commands::Server { bind } => run_server(config, bind).await,
        Commands::Agent {
            master_url,
            name,
            bind,
            advertise_url,
            labels,
            max_builds,
            workspace,
            region,
        } => {
            let agent_config = AgentConfig {
                master_url,
                name,
                bind,
                advertise_url,
                labels: labels.into_iter().collect::<BTreeSet<_>>(),
                max_builds,
                auth_token: config.distributed.auth_token.clone(),
                workspace_root: workspace,
                region,
                heartbeat_interval: Duration::from_secs(15),
            };
            match AgentWorker::run(agent_config).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("agent error: {e}");
                    ExitCode::from(EXIT_COMMAND)
                }
            }
        }
        Commands::Trigger {
            master_url,
            job,
            branch,
            parameters,
        } => run_trigger(&master_url, &job, branch, parameters).await,
        Commands::Validate { path } => match chengis_config::pipeline::parse_file(&path) {
            Ok(pipeline) => {
                println!(
                    "ok: {} ({} stages)",
                    pipeline.name,
                    pipeline.stages.len()
                );
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("invalid pipeline: {e}");
                ExitCode::from(EXIT_COMMAND)
            }
        },
    }
}

async fn run_server(config: SystemConfig, bind: Option<String>) -> ExitCode {
    let bind = bind.unwrap_or_else(|| config.server.bind.clone());
    let state = match chengis_master::AppState::init(config).await {
        Ok(state) => state,
        Err(e) => {
            eprintln!("database error: {e}");
            return ExitCode::from(EXIT_DATABASE);
        }
    };
    let result = chengis_master::serve(state.clone(), &bind).await;
    state.shutdown().await;
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("server error: {e}");
            ExitCode::from(EXIT_COMMAND)
        }
    }
}

async fn run_trigger(
    master_url: &str,
    job: &str,
    branch: Option<String>,
    parameters: Vec<String>,
) -> ExitCode {
    let mut params = serde_json::Map::new();
    for pair in parameters {
        match pair.split_once('=') {
            Some((key, value)) => {
                params.insert(key.to_string(), serde_json::Value::String(value.to_string()));
            }
            None => {
                eprintln!("invalid parameter {pair:?}, expected key=value");
                return ExitCode::from(EXIT_COMMAND);
            }
        }
    }
    let body = serde_json::json!({ "branch": branch, "parameters": params });
    let url = format!("{}/jobs/{}/trigger", master_url.trim_end_matches('/'), job);
    let client = reqwest::Client::new();
    match client.post(&url).json(&body).send().await {
        Ok(response) if response.status().is_success() => {
            match response.json::<serde_json::Value>().await {
                Ok(accepted) => {
                    println!(
                        "build {} (#{}) {}",
                        accepted["build_id"].as_str().unwrap_or("?"),
                        accepted["number"],
                        accepted["decision"]["mode"].as_str().unwrap_or("?"),
                    );
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("malformed response: {e}");
                    ExitCode::from(EXIT_COMMAND)
                }
            }
        }
        Ok(response) => {
            eprintln!("trigger rejected: {}", response.status());
            ExitCode::from(EXIT_COMMAND)
        }
        Err(e) => {
            eprintln!("trigger failed: {e}");
            ExitCode::from(EXIT_COMMAND)
        }
    }
}
