//! CLI entry point for parley.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::ParleyConfig;
use crate::error::ParleyError;
use crate::policy::CallerRole;
use crate::service::{Caller, ChatRequest, ChatService};
use crate::session::SessionManager;
use crate::stream::StreamChunk;
use crate::tools::CapabilityRegistry;

/// Parley chat CLI
#[derive(Parser, Debug)]
#[command(name = "parley", version, about = "Session-aware tool-calling chat")]
pub struct Cli {
    /// Config file (defaults to ~/.parley/config.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Ask a question, optionally continuing a session
    Chat(ChatArgs),
    /// Print the stored history of a session
    History(HistoryArgs),
}

/// Arguments for the `chat` subcommand.
#[derive(Parser, Debug)]
pub struct ChatArgs {
    /// The question
    pub query: String,

    /// Continue an existing session
    #[arg(short, long)]
    pub session: Option<String>,

    /// Caller role (admin, user, guest)
    #[arg(short, long, default_value = "user")]
    pub role: String,

    /// Caller identity recorded in logs
    #[arg(long, default_value = "cli")]
    pub identity: String,

    /// Print the answer as it is generated
    #[arg(long)]
    pub stream: bool,
}

/// Arguments for the `history` subcommand.
#[derive(Parser, Debug)]
pub struct HistoryArgs {
    pub session_id: String,
}

/// Install the global tracing subscriber. `RUST_LOG` overrides the default.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,parley=info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

/// Run a parsed command line.
///
/// The CLI ships no tools of its own; embedders register theirs and call
/// [`run_with_registry`].
pub async fn run(cli: Cli) -> Result<(), ParleyError> {
    run_with_registry(cli, CapabilityRegistry::new()).await
}

pub async fn run_with_registry(cli: Cli, registry: CapabilityRegistry) -> Result<(), ParleyError> {
    let config = ParleyConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Chat(args) => {
            let service = ChatService::from_config(&config, Arc::new(registry))?;
            let result = handle_chat(&service, args).await;
            service.shutdown().await?;
            result
        }
        // Read-only; needs no model credentials.
        Commands::History(args) => {
            let sessions = SessionManager::new(config.checkpoint.open());
            let result = handle_history(&sessions, &args.session_id).await;
            sessions.store().close().await?;
            result
        }
    }
}

async fn handle_chat(service: &ChatService, args: ChatArgs) -> Result<(), ParleyError> {
    let caller = Caller::new(args.identity, CallerRole::from(args.role.as_str()));
    let mut request = ChatRequest::new(args.query);
    request.session_id = args.session;

    if !args.stream {
        let reply = service.chat(&caller, request).await?;
        println!("{}", reply.answer);
        eprintln!("session: {} ({})", reply.session_id, reply.status);
        return Ok(());
    }

    let mut stream = service.chat_stream(&caller, request).await?;
    let mut stdout = std::io::stdout();
    while let Some(chunk) = stream.next().await {
        match chunk {
            StreamChunk::Text { text } => {
                print!("{text}");
                stdout.flush()?;
            }
            StreamChunk::Done { session_id, status } => {
                println!();
                eprintln!("session: {session_id} ({status})");
            }
            StreamChunk::Error { message } => {
                println!();
                return Err(ParleyError::Stream(message));
            }
        }
    }
    Ok(())
}

async fn handle_history(sessions: &SessionManager, session_id: &str) -> Result<(), ParleyError> {
    let history = sessions.load(session_id).await?;
    if history.is_empty() {
        eprintln!("no history for session {session_id}");
        return Ok(());
    }
    for message in history {
        match (message.tool_calls.is_empty(), &message.tool_call_id) {
            (false, _) => {
                let names: Vec<_> = message.tool_calls.iter().map(|c| c.name.as_str()).collect();
                println!("[{}] -> {}", message.role, names.join(", "));
            }
            (true, Some(id)) => println!("[{} {id}] {}", message.role, message.content),
            (true, None) => println!("[{}] {}", message.role, message.content),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_arguments_parse() {
        let cli = Cli::parse_from([
            "parley", "chat", "price of bitcoin?", "--session", "abc", "--role", "admin", "--stream",
        ]);
        let Commands::Chat(args) = cli.command else {
            panic!("expected chat");
        };
        assert_eq!(args.query, "price of bitcoin?");
        assert_eq!(args.session.as_deref(), Some("abc"));
        assert_eq!(CallerRole::from(args.role.as_str()), CallerRole::Admin);
        assert!(args.stream);
    }

    #[tokio::test]
    async fn history_reads_the_store_without_model_credentials() {
        use crate::checkpoint::{CheckpointStore, FileCheckpointStore};
        use crate::types::Message;

        let dir = tempfile::TempDir::new().unwrap();
        let sessions_dir = dir.path().join("sessions");
        let store = FileCheckpointStore::new(&sessions_dir);
        let lease = store.acquire("s-1").await.unwrap();
        store
            .save(&lease, &[Message::human("hi"), Message::ai("Hello!")])
            .await
            .unwrap();
        drop(lease);

        let config_path = dir.path().join("config.toml");
        std::fs::write(
            &config_path,
            format!(
                "[checkpoint]\nbackend = \"file\"\ndir = {:?}\n",
                sessions_dir.display().to_string()
            ),
        )
        .unwrap();

        let cli = Cli::parse_from([
            "parley",
            "history",
            "s-1",
            "--config",
            config_path.to_str().unwrap(),
        ]);
        run(cli).await.unwrap();
    }

    #[test]
    fn history_accepts_global_config() {
        let cli = Cli::parse_from(["parley", "history", "abc", "--config", "/tmp/p.toml"]);
        assert!(matches!(cli.command, Commands::History(ref a) if a.session_id == "abc"));
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/p.toml")));
    }
}
