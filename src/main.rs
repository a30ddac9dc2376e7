mod api;
mod replay;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use elsie_backend::config::EngineConfig;
use elsie_backend::roleplay::IncomingMessage;
use tracing_subscriber::EnvFilter;

use api::{ApiClient, WatchEvent};

#[derive(Parser)]
#[command(name = "elsie")]
#[command(about = "Operator console for the Elsie scene engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one chat message and print the decision
    Send {
        /// Channel id the message was posted in
        #[arg(long)]
        channel: Option<String>,
        /// Channel display name, used when the id is unknown
        #[arg(long)]
        channel_name: Option<String>,
        #[arg(long, default_value = "cli")]
        author: String,
        /// Treat as a direct message
        #[arg(long)]
        dm: bool,
        text: String,
    },
    /// Replay a JSONL transcript of messages
    Replay {
        file: PathBuf,
        /// Run against an in-process engine instead of the backend
        #[arg(long)]
        offline: bool,
    },
    /// List sessions, or show one by key
    Sessions { key: Option<String> },
    /// Show recent decisions from the journal
    Decisions {
        #[arg(long)]
        channel: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Close sessions past the inactivity timeout now
    Sweep,
    /// Print the backend's effective configuration
    Config,
    /// Follow live engine events
    Watch,
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_watch_event(event: &WatchEvent) {
    match event {
        WatchEvent::Decision {
            session_key,
            response_type,
            should_respond,
            reasoning,
        } => println!(
            "[{}] {} respond={} {}",
            session_key, response_type, should_respond, reasoning
        ),
        WatchEvent::SessionChanged {
            session_key,
            from,
            to,
            reason,
            participants,
        } => println!(
            "[{}] {} -> {} ({}) roster: {}",
            session_key,
            from,
            to,
            reason,
            participants.join(", ")
        ),
        WatchEvent::ResponseRequested {
            session_key,
            response_type,
            approach,
        } => println!("[{}] response requested: {} / {}", session_key, response_type, approach),
        WatchEvent::Other(kind) => tracing::debug!("Ignoring event '{}'", kind),
    }
}

async fn run(command: Commands) -> Result<()> {
    let client = ApiClient::from_env();

    match command {
        Commands::Send {
            channel,
            channel_name,
            author,
            dm,
            text,
        } => {
            let mut message = IncomingMessage::new("", &author, &text);
            message.channel_id = channel;
            message.channel_name = channel_name;
            message.is_direct_message = dm;
            let outcome = client.send_message(&message).await?;
            print_json(&outcome)?;
        }
        Commands::Replay { file, offline } => {
            let transcript = replay::load_transcript(&file)?;
            tracing::info!("Replaying {} messages from {}", transcript.len(), file.display());
            let decisions = if offline {
                replay::replay_offline(EngineConfig::load(), &transcript).await?
            } else {
                replay::replay_remote(&client, &transcript).await?
            };
            for decision in &decisions {
                println!("{}", serde_json::to_string(decision)?);
            }
        }
        Commands::Sessions { key: Some(key) } => {
            print_json(&client.get_session(&key).await?)?;
        }
        Commands::Sessions { key: None } => {
            print_json(&client.list_sessions().await?)?;
        }
        Commands::Decisions { channel, limit } => {
            let decisions = client.list_decisions(channel.as_deref(), limit).await?;
            for record in &decisions {
                println!(
                    "{} [{}] {} respond={} rule={} :: {}",
                    record.decided_at.format("%H:%M:%S"),
                    record.channel_label,
                    record.response_type.as_db_str(),
                    record.should_respond,
                    record.rule.as_str(),
                    record.message_text
                );
            }
        }
        Commands::Sweep => {
            let closed = client.sweep().await?;
            println!("Closed {} session(s)", closed);
        }
        Commands::Config => {
            print_json(&client.get_config().await?)?;
        }
        Commands::Watch => {
            tracing::info!("Watching {}", client.base_url());
            let (tx, rx) = flume::unbounded();
            tokio::spawn(client.stream_events_forever(tx));
            while let Ok(event) = rx.recv_async().await {
                print_watch_event(&event);
            }
        }
    }

    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,elsie=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Failed to create tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(cli.command)) {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}
