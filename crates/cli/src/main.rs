//! Template store CLI - database migrations and order administration.
//!
//! # Usage
//!
//! ```bash
//! # Run database migrations
//! ts-cli migrate
//!
//! # List the newest orders
//! ts-cli orders list --limit 50
//!
//! # Mark a paid order as delivered
//! ts-cli orders deliver 42
//!
//! # Refund an order at the gateway and mark it refunded
//! ts-cli orders refund 42 --reason "duplicate purchase"
//! ```

#![cfg_attr(not(test), forbid(unsafe_code))]

use clap::{Parser, Subcommand};

use template_store_core::OrderId;

mod commands;

#[derive(Parser)]
#[command(name = "ts-cli")]
#[command(author, version, about = "Template store CLI tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations
    Migrate,
    /// Inspect and administer orders
    Orders {
        #[command(subcommand)]
        action: OrderAction,
    },
}

#[derive(Subcommand)]
enum OrderAction {
    /// List orders, newest first
    List {
        #[arg(short, long)]
        limit: Option<i64>,

        #[arg(short, long)]
        offset: Option<i64>,
    },
    /// Move a paid order to delivered
    Deliver {
        /// Order ID
        id: OrderId,
    },
    /// Refund a paid or delivered order
    Refund {
        /// Order ID
        id: OrderId,

        /// Reason recorded on the order
        #[arg(short, long)]
        reason: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let result: Result<(), Box<dyn std::error::Error>> = run(cli).await;

    if let Err(e) = result {
        tracing::error!("Command failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Migrate => commands::migrate::run().await?,
        Commands::Orders { action } => match action {
            OrderAction::List { limit, offset } => commands::orders::list(limit, offset).await?,
            OrderAction::Deliver { id } => commands::orders::deliver(id).await?,
            OrderAction::Refund { id, reason } => {
                commands::orders::refund(id, reason.as_deref()).await?;
            }
        },
    }
    Ok(())
}
