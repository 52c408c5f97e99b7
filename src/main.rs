//! chat-sync - live chat client over a local document store
//!
//! A terminal front end for the sync core: sign in as a user, list chats,
//! read and send messages, and mark chats read.

mod cli;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cli::Workspace;

#[derive(Parser)]
#[command(name = "chat-sync")]
#[command(about = "Live-sync chat client over a local document store", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Store snapshot file (overrides the configured path)
    #[arg(long, global = true)]
    store: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in as an existing user
    Login {
        /// User ID
        user: String,
    },

    /// Sign out
    Logout,

    /// Show the signed-in user and store location
    Status,

    /// Create or replace a user profile
    AddUser {
        /// User ID
        id: String,

        /// Display name
        #[arg(short, long)]
        name: String,
    },

    /// List chats, most recent first
    Chats {
        /// Maximum number of chats to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Read messages from a chat
    Read {
        /// Chat ID (from `chats` output)
        chat_id: String,

        /// Maximum number of messages to show
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Older pages to load before printing
        #[arg(long, default_value = "0")]
        older: usize,
    },

    /// Send a message
    Send {
        /// Chat ID (from `chats` output)
        #[arg(short, long)]
        to: String,

        /// Message content
        message: String,
    },

    /// Open (or create) the direct chat with a user
    Direct {
        /// Other user's ID
        user: String,
    },

    /// Create a group chat
    Group {
        /// Group name
        name: String,

        /// Member IDs (you are added automatically)
        #[arg(required = true)]
        members: Vec<String>,
    },

    /// Mark a chat read and send read receipts
    MarkRead {
        /// Chat ID (from `chats` output)
        chat_id: String,
    },

    /// Run a scripted two-user session in memory
    Demo,
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

    if let Commands::Demo = cli.command {
        return cli::demo::run().await;
    }

    let mut ws = Workspace::open(cli.store)?;
    match cli.command {
        Commands::Login { user } => {
            cli::login(&mut ws, &user).await?;
        }
        Commands::Logout => {
            cli::logout(&mut ws)?;
        }
        Commands::Status => {
            cli::status(&ws).await?;
        }
        Commands::AddUser { id, name } => {
            cli::add_user(&ws, &id, &name).await?;
        }
        Commands::Chats { limit } => {
            tracing::debug!("Loading chats...");
            cli::list_chats(&ws, limit).await?;
        }
        Commands::Read {
            chat_id,
            limit,
            older,
        } => {
            cli::read_messages(&ws, &chat_id, limit, older).await?;
        }
        Commands::Send { to, message } => {
            tracing::info!("Sending message...");
            cli::send_message(&ws, &to, &message).await?;
        }
        Commands::Direct { user } => {
            cli::start_direct(&ws, &user).await?;
        }
        Commands::Group { name, members } => {
            cli::create_group(&ws, &name, &members).await?;
        }
        Commands::MarkRead { chat_id } => {
            cli::mark_read(&ws, &chat_id).await?;
        }
        Commands::Demo => {}
    }

    Ok(())
}
