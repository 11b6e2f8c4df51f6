// ABOUTME: Entry point for the readerlink binary.
// ABOUTME: Parses CLI arguments, initializes tracing, runs the agent and maps restart requests to exit codes.

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use readerlink_agent::{AgentConfig, AgentOptions, MqttTransport};
use readerlink_core::RestartReason;
use readerlink_store::{RecordStore, SettingsFile};
use tokio::io::BufReader;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(name = "readerlink", version, about = "Store-and-forward edge agent for reader events")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to the broker and deliver queued records (default).
    Run {
        /// Queue every JSON object read line by line from stdin.
        #[arg(long)]
        stdin: bool,
    },
    /// Print the records waiting for delivery, one JSON object per line.
    Pending,
    /// Print the effective runtime settings.
    Settings,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(
                    "readerlink=info,readerlink_agent=info,readerlink_store=info",
                )
            }),
        )
        .init();

    let cli = Cli::parse();
    let config = AgentConfig::from_env()?;

    match cli.command.unwrap_or(Command::Run { stdin: false }) {
        Command::Run { stdin } => run(config, stdin).await,
        Command::Pending => {
            let store = RecordStore::open(&config.records_path());
            for record in store.records().await {
                println!("{}", serde_json::to_string(&record)?);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Settings => {
            let settings = SettingsFile::new(&config.settings_path()).load();
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run(config: AgentConfig, stdin: bool) -> anyhow::Result<ExitCode> {
    tracing::info!(home = %config.home.display(), broker = %config.broker_host, port = config.broker_port, "readerlink starting up");

    let settings_file = SettingsFile::new(&config.settings_path());
    let settings = settings_file.load();
    let store = Arc::new(RecordStore::open(&config.records_path()));
    tracing::info!(pending = store.len().await, "record store opened");

    let transport = MqttTransport::from_config(&config);
    let mut agent = readerlink_agent::start(
        transport,
        store,
        settings_file,
        settings,
        AgentOptions::from_config(&config),
    )?;

    // Status events stand in for the reader's LEDs and buzzer
    let mut status = agent.status.subscribe();
    tokio::spawn(async move {
        loop {
            match status.recv().await {
                Ok(event) => tracing::debug!(event = event.name(), ?event, "status"),
                Err(RecvError::Lagged(missed)) => tracing::debug!(missed, "status events skipped"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    if stdin {
        let producer = agent.producer.clone();
        tokio::spawn(async move {
            match producer.submit_lines(BufReader::new(tokio::io::stdin())).await {
                Ok(queued) => tracing::info!(queued, "stdin closed"),
                Err(e) => tracing::warn!(error = %e, "failed to read stdin"),
            }
        });
    }

    let reason = tokio::select! {
        reason = agent.wait_for_restart() => reason,
        _ = tokio::signal::ctrl_c() => RestartReason::Interrupted,
    };

    agent.shutdown(&reason).await;

    if reason.is_restart() {
        tracing::warn!(%reason, exit_code = reason.exit_code(), "exiting for restart");
    } else {
        tracing::info!("readerlink stopped");
    }
    Ok(ExitCode::from(reason.exit_code()))
}
