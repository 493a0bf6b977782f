//! Marki CLI - Terminal Chat Client
//!
//! Line-oriented driver for the Marki chat core. Plain lines are sent as
//! messages; slash commands manage conversations and the session. Replies
//! stream to stdout, logs go to stderr.
//!
//! # Usage
//!
//! ```bash
//! # Chat as a guest against the default backend
//! marki-cli
//!
//! # Custom backend and personality
//! marki-cli --api-url https://marki.example.com --personality vinhyet
//!
//! # Log in on start
//! MARKI_PASSWORD=... marki-cli --email me@example.com
//!
//! # Verbose logging
//! RUST_LOG=marki_core=debug marki-cli
//! ```
//!
//! # Signals
//!
//! - `SIGINT`: cancel the streaming reply, or quit when idle

mod commands;
mod render;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use commands::{Command, HELP};
use marki_core::{
    default_config_path, load_config_from_path, ChatError, ChatStore, ClientConfig,
    ConfigOverrides, ConversationId, FileHistory, GuestHistory, HttpBackend, Mode, NoHistory,
    SendOutcome, SessionModeGate, SessionTracker, SseTransport,
};
use render::{label, Transcript};

/// Marki CLI - chat with Marki personalities from the terminal
#[derive(Parser, Debug)]
#[command(name = "marki-cli")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "MARKI_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Backend base URL
    #[arg(long, value_name = "URL")]
    api_url: Option<String>,

    /// Personality for new conversations
    #[arg(short = 'p', long, value_name = "SLUG")]
    personality: Option<String>,

    /// Account email for /login
    #[arg(short = 'e', long, env = "MARKI_EMAIL")]
    email: Option<String>,

    /// Account password for /login
    #[arg(long, env = "MARKI_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "MARKI_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("marki_cli={level},marki_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

/// Load the config file and apply command-line overrides
fn build_config(args: &Args) -> Result<ClientConfig> {
    let path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(path).context("Failed to load configuration")?;

    let mut overrides = ConfigOverrides::new();
    if let Some(url) = &args.api_url {
        overrides = overrides.with_base_url(url.clone());
    }
    if let Some(slug) = &args.personality {
        overrides = overrides.with_default_personality(slug.clone());
    }
    overrides.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    Ok(config)
}

fn guest_history(config: &ClientConfig) -> Arc<dyn GuestHistory> {
    if !config.persist_guest_history {
        return Arc::new(NoHistory);
    }
    match config
        .guest_history_path
        .clone()
        .or_else(FileHistory::default_path)
    {
        Some(path) => Arc::new(FileHistory::new(path)),
        None => {
            warn!("No data directory, guest history will not be kept");
            Arc::new(NoHistory)
        }
    }
}

/// Everything a command needs
struct Client {
    store: ChatStore,
    session: Arc<SessionTracker>,
    email: Option<String>,
    password: Option<String>,
}

impl Client {
    /// Run one command; returns false to quit
    async fn execute(&self, command: Command) -> Result<bool, ChatError> {
        match command {
            Command::Say(text) => {
                let store = self.store.clone();
                tokio::spawn(async move {
                    match store.send_message(&text).await {
                        Ok(SendOutcome::Ignored) => println!("(still answering, /cancel to stop)"),
                        Ok(outcome) => tracing::debug!(?outcome, "Exchange finished"),
                        Err(e) => println!("! {e}"),
                    }
                });
            }
            Command::New => self.store.select_conversation(None).await?,
            Command::List => {
                self.store.fetch_conversations(true).await?;
                self.print_conversations();
            }
            Command::More => {
                self.store.fetch_conversations(false).await?;
                self.print_conversations();
            }
            Command::Open(id) => {
                self.store
                    .select_conversation(Some(ConversationId::from(id.as_str())))
                    .await?;
                self.print_history();
            }
            Command::Older => {
                let count = self.store.load_older_messages().await?;
                println!("({count} older messages)");
                if count > 0 {
                    self.print_history();
                }
            }
            Command::DeleteFrom(index) => self.store.delete_messages_from_index(index).await?,
            Command::DeleteConversation(id) => {
                self.store
                    .delete_conversation(&ConversationId::from(id.as_str()))
                    .await?;
            }
            Command::Personality(slug) => {
                if marki_core::personality::find(&slug).is_none() {
                    println!("(unknown personality {slug}, sending it anyway)");
                }
                self.store.update_conversation_personality(&slug).await?;
            }
            Command::Context(text) => self.store.update_context_override(&text).await?,
            Command::History => self.print_history(),
            Command::Cancel => {
                if !self.store.cancel_exchange() {
                    println!("(nothing to cancel)");
                }
            }
            Command::Login => self.login().await,
            Command::Logout => {
                if let Err(e) = self.session.logout().await {
                    warn!(error = %e, "Logout failed on the server");
                }
            }
            Command::Help => println!("{HELP}"),
            Command::Quit => return Ok(false),
        }
        Ok(true)
    }

    async fn login(&self) {
        let (Some(email), Some(password)) = (&self.email, &self.password) else {
            println!("! set --email and MARKI_PASSWORD to log in");
            return;
        };
        match self.session.login(email, password).await {
            Ok(user) => println!(
                "(logged in as {})",
                user.display_name.as_deref().unwrap_or(&user.email)
            ),
            Err(_) => println!(
                "! {}",
                self.session
                    .last_error()
                    .unwrap_or_else(|| "login failed".to_string())
            ),
        }
    }

    fn print_conversations(&self) {
        let snapshot = self.store.snapshot();
        for c in &snapshot.conversations {
            println!(
                "{}  {}  ({}, {} messages)",
                c.id, c.title, c.personality_slug, c.message_count
            );
        }
        if snapshot.has_more_conversations {
            println!("(/more for older conversations)");
        }
    }

    fn print_history(&self) {
        let snapshot = self.store.snapshot();
        if snapshot.has_more_messages {
            println!("(/older for earlier messages)");
        }
        for (i, m) in snapshot.messages.iter().enumerate() {
            println!("[{i}] {}: {}", label(m.sender), m.content);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config = build_config(&args)?;
    info!(url = %config.base_url, "Starting Marki CLI");

    let backend = Arc::new(
        HttpBackend::new(&config.base_url, config.request_timeout)
            .context("Failed to create HTTP client")?,
    );
    let transport = Arc::new(SseTransport::new(
        backend.client(),
        &config.base_url,
        &config.stream_path,
    ));
    let store = ChatStore::new(&config, transport, backend.clone(), guest_history(&config));
    let session = Arc::new(SessionTracker::new(backend));

    // Settle the initial mode before anything is shown
    let gate = SessionModeGate::new(store.clone());
    session.refresh().await;
    gate.observe(&session.status()).await;
    match store.mode() {
        Mode::Guest => match store.restore_guest_history().await {
            Ok(0) => {}
            Ok(count) => println!("(restored {count} messages)"),
            Err(e) => warn!(error = %e, "Failed to restore guest history"),
        },
        Mode::Authenticated => {
            if let Err(e) = store.fetch_conversations(true).await {
                warn!(error = %e, "Failed to load conversations");
            }
        }
    }
    println!("-- {} mode, /help for commands --", store.mode());

    tokio::spawn(gate.run(session.subscribe()));
    tokio::spawn(Transcript::new(store.clone()).run(store.subscribe()));

    let client = Client {
        store,
        session,
        email: args.email,
        password: args.password,
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => {
                if client.store.cancel_exchange() {
                    continue;
                }
                break;
            }
        };
        let Some(line) = line else {
            break;
        };

        let command = match commands::parse(&line) {
            None => continue,
            Some(Ok(command)) => command,
            Some(Err(e)) => {
                println!("! {e}");
                continue;
            }
        };
        match client.execute(command).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => println!("! {e}"),
        }
    }

    client.store.cancel_exchange();
    info!("Marki CLI stopped");
    Ok(())
}
