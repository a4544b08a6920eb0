//! chat-sync - real-time conversation synchronization client
//!
//! Keeps two-party (optionally request-scoped) conversations in sync over a
//! push channel, with optimistic sends and request/response fallback.

mod api;
mod config;
mod console;
mod error;
mod models;
mod room;
mod sync;
mod transport;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "chat-sync")]
#[command(about = "Real-time conversation synchronization client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a session token and the local identity
    Login {
        /// Session token issued by the chat server
        #[arg(short, long)]
        token: String,

        /// Your participant id
        #[arg(short, long)]
        user_id: String,

        /// Display name (defaults to the id)
        #[arg(short, long)]
        name: Option<String>,

        /// patient, pharmacy, doctor or customer-care
        #[arg(short, long, default_value = "patient")]
        role: String,
    },

    /// Clear the stored session token
    Logout,

    /// Show configuration and identity
    Status,

    /// Print the history of a conversation
    History {
        /// The other participant
        #[arg(short, long)]
        with: String,

        /// Request scope (e.g. an order id)
        #[arg(short, long)]
        scope: Option<String>,
    },

    /// Send a message without opening the push channel
    Send {
        /// The other participant
        #[arg(short, long)]
        to: String,

        /// Request scope (e.g. an order id)
        #[arg(short, long)]
        scope: Option<String>,

        /// Message content
        message: String,
    },

    /// Interactive chat over the push channel
    Chat {
        /// The other participant
        #[arg(short, long)]
        with: String,

        /// Request scope (e.g. an order id)
        #[arg(short, long)]
        scope: Option<String>,

        /// Count unread messages for other conversations (peer or peer:scope)
        #[arg(long)]
        track: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Login {
            token,
            user_id,
            name,
            role,
        } => {
            console::login(&token, &user_id, name.as_deref(), &role).await?;
        }
        Commands::Logout => {
            tracing::info!("Logging out...");
            console::logout().await?;
        }
        Commands::Status => {
            console::status().await?;
        }
        Commands::History { with, scope } => {
            tracing::info!("Fetching history...");
            console::history(&with, scope.as_deref()).await?;
        }
        Commands::Send { to, scope, message } => {
            tracing::info!("Sending message...");
            console::send(&to, scope.as_deref(), &message).await?;
        }
        Commands::Chat { with, scope, track } => {
            console::chat(&with, scope.as_deref(), &track).await?;
        }
    }

    Ok(())
}
