mod config;
mod config_dir;
mod logging;
mod manager;
mod messages;
mod monitor;
mod ports;
mod process;
mod runtime;
mod state;
mod transport;

use clap::{Parser, Subcommand};
use config::{AgentConfig, ConfigError};
use config_dir::ConfigDir;
use manager::{AgentProcessManager, AgentStatusReport, StartOutcome, StopOutcome};
use messages::{DagSeed, InboundMessage, StatusReport};
use state::{AgentState, StateFile};
use std::path::PathBuf;
use std::process::ExitCode;

/// Starts, stops and queries the local campaign agent, and runs the agent itself.
#[derive(Parser, Debug)]
#[command(name = "campaign-agent", version, about)]
pub struct Cli {
    /// Config directory (default: $CAMPAIGN_AGENT_HOME, then the platform config dir)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Extra logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Launch the agent in the background
    Start,
    /// Kill the running agent
    Stop,
    /// Print the recorded agent status
    Status {
        /// Print the whole state record as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run the agent in the foreground (this is what `start` launches)
    Run {
        /// Unique token segregating this run's logs
        #[arg(long)]
        log_path: String,
        #[arg(long)]
        debug: bool,
        #[arg(long)]
        heartbeat_port: u16,
        #[arg(long)]
        activity_port: u16,
    },
    /// Send one message to the running agent
    Send {
        #[command(subcommand)]
        message: SendCommand,
    },
    /// Print heartbeats from the running agent
    Heartbeats,
    /// Create the config directory with a default config.toml
    Init,
}

#[derive(Subcommand, Debug)]
enum SendCommand {
    /// Stop monitoring the current campaign
    Kill,
    /// Report an activity's status
    Report { activity_id: String, status: String },
    /// Start monitoring a campaign from a DAG JSON file
    Dag { file: PathBuf },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let dir = cli
        .config_dir
        .clone()
        .map(ConfigDir::new)
        .unwrap_or_else(ConfigDir::from_env);

    if let Command::Run {
        log_path,
        debug,
        heartbeat_port,
        activity_port,
    } = &cli.command
    {
        let args = runtime::RunArgs {
            log_path: log_path.clone(),
            debug: *debug,
            heartbeat_port: *heartbeat_port,
            activity_port: *activity_port,
        };
        return run(&dir, &args).await;
    }

    logging::init_cli(cli.verbose);
    tracing::debug!(?cli, "parsed CLI arguments");

    if let Command::Init = cli.command {
        return match dir.init() {
            Ok(created) => {
                tracing::info!(dir = %dir.root().display(), created, "config directory ready");
                ExitCode::SUCCESS
            }
            Err(e) => {
                tracing::error!(dir = %dir.root().display(), error = %e, "failed to initialize");
                ExitCode::FAILURE
            }
        };
    }

    let config = match AgentConfig::load(&dir.config()) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "cannot load configuration");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Command::Start => start(&config, &dir),
        Command::Stop => stop(&config, &dir),
        Command::Status { json } => status(&config, &dir, json),
        Command::Send { message } => send(&config, &dir, message).await,
        Command::Heartbeats => heartbeats(&config, &dir).await,
        Command::Run { .. } | Command::Init => ExitCode::SUCCESS,
    }
}

async fn run(dir: &ConfigDir, args: &runtime::RunArgs) -> ExitCode {
    let loaded = AgentConfig::load(&dir.config());

    // `start` discards stdout/stderr, so even a bad config is reported in the run's log.
    let _guard = match logging::init_agent(&agent_log_dir(dir, &loaded), &args.log_path, args.debug)
    {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("cannot open agent log: {e}");
            return ExitCode::FAILURE;
        }
    };

    let config = match loaded {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "cannot load configuration, agent exiting");
            return ExitCode::FAILURE;
        }
    };

    match runtime::run_agent(&config, args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "agent failed");
            ExitCode::FAILURE
        }
    }
}

/// Log directory for the agent, falling back to the default layout when the
/// config cannot be loaded.
fn agent_log_dir(dir: &ConfigDir, loaded: &Result<AgentConfig, ConfigError>) -> PathBuf {
    match loaded {
        Ok(config) => dir.log_dir(config),
        Err(_) => dir.log_dir(&AgentConfig::default()),
    }
}

fn manager(config: &AgentConfig, dir: &ConfigDir) -> Option<AgentProcessManager> {
    match AgentProcessManager::from_config(config, dir) {
        Ok(m) => Some(m),
        Err(e) => {
            tracing::error!(error = %e, "cannot set up agent manager");
            None
        }
    }
}

fn start(config: &AgentConfig, dir: &ConfigDir) -> ExitCode {
    let Some(mgr) = manager(config, dir) else {
        return ExitCode::FAILURE;
    };
    match mgr.start() {
        Ok(StartOutcome::Started(_)) | Ok(StartOutcome::AlreadyRunning(_)) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "start aborted");
            ExitCode::FAILURE
        }
    }
}

fn stop(config: &AgentConfig, dir: &ConfigDir) -> ExitCode {
    let Some(mgr) = manager(config, dir) else {
        return ExitCode::FAILURE;
    };
    match mgr.stop() {
        StopOutcome::Unreadable => ExitCode::FAILURE,
        StopOutcome::NeverStarted | StopOutcome::NotRunning(_) | StopOutcome::Stopped(_) => {
            ExitCode::SUCCESS
        }
    }
}

fn status(config: &AgentConfig, dir: &ConfigDir, json: bool) -> ExitCode {
    let Some(mgr) = manager(config, dir) else {
        return ExitCode::FAILURE;
    };
    match mgr.status() {
        AgentStatusReport::Recorded(state) => {
            if json {
                match serde_json::to_string_pretty(&state) {
                    Ok(s) => println!("{s}"),
                    Err(e) => {
                        tracing::error!(error = %e, "failed to encode state");
                        return ExitCode::FAILURE;
                    }
                }
            } else {
                println!("{}", state.status);
            }
            ExitCode::SUCCESS
        }
        AgentStatusReport::NeverStarted => {
            if !json {
                println!("agent does not exist, use start");
            }
            ExitCode::SUCCESS
        }
        AgentStatusReport::Unreadable => ExitCode::FAILURE,
    }
}

/// The running agent's record, or None (logged) when there is no usable one.
fn running_state(config: &AgentConfig, dir: &ConfigDir) -> Option<AgentState> {
    match StateFile::new(dir.state_file(config)).load() {
        Ok(Some(state)) if state.is_running() => Some(state),
        Ok(Some(state)) => {
            tracing::error!(status = %state.status, "agent is not running");
            None
        }
        Ok(None) => {
            tracing::error!("agent does not exist, use start");
            None
        }
        Err(e) => {
            tracing::error!(error = %e, "cannot read agent state");
            None
        }
    }
}

/// Address to dial for a listener bound on `bind_host`.
fn connect_host(bind_host: &str) -> &str {
    match bind_host {
        "0.0.0.0" => "127.0.0.1",
        "::" => "::1",
        other => other,
    }
}

async fn send(config: &AgentConfig, dir: &ConfigDir, command: SendCommand) -> ExitCode {
    let Some(port) = running_state(config, dir).and_then(|s| s.activity_port) else {
        return ExitCode::FAILURE;
    };

    let message = match command {
        SendCommand::Kill => InboundMessage::Kill,
        SendCommand::Report {
            activity_id,
            status,
        } => InboundMessage::Report(StatusReport::new(activity_id, status)),
        SendCommand::Dag { file } => {
            let seed = std::fs::read_to_string(&file)
                .map_err(|e| e.to_string())
                .and_then(|s| serde_json::from_str::<DagSeed>(&s).map_err(|e| e.to_string()));
            match seed {
                Ok(seed) => InboundMessage::Dag(seed),
                Err(e) => {
                    tracing::error!(file = %file.display(), error = %e, "cannot read DAG");
                    return ExitCode::FAILURE;
                }
            }
        }
    };

    let host = connect_host(&config.ports.bind_host);
    match transport::send_message(host, port, &message).await {
        Ok(()) => {
            tracing::info!(port, "message delivered");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to deliver message");
            ExitCode::FAILURE
        }
    }
}

async fn heartbeats(config: &AgentConfig, dir: &ConfigDir) -> ExitCode {
    let Some(port) = running_state(config, dir).and_then(|s| s.heartbeat_port) else {
        return ExitCode::FAILURE;
    };

    let host = connect_host(&config.ports.bind_host);
    let result = transport::follow_heartbeats(host, port, |beat| {
        match serde_json::to_string(&beat) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::warn!(error = %e, "failed to encode heartbeat"),
        }
    })
    .await;

    match result {
        Ok(()) => {
            tracing::info!("agent closed the heartbeat channel");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "heartbeat subscription failed");
            ExitCode::FAILURE
        }
    }
}
