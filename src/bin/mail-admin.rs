//! CLI tool for managing mail users.
//!
//! # Usage
//!
//! ```bash
//! # Register a new user
//! mail-admin add alice s3cret --db sqlite://mail.db?mode=rwc --host localhost
//!
//! # Delete a user (requires the password)
//! mail-admin delete alice s3cret
//!
//! # List all users
//! mail-admin list
//!
//! # Check whether a user exists
//! mail-admin exists alice
//! ```

use clap::{Parser, Subcommand};
use smtp_rs::store::MailStore;

#[derive(Parser)]
#[command(name = "mail-admin")]
#[command(about = "Manage mail server user accounts", long_about = None)]
struct Cli {
    /// Database URL
    #[arg(long, default_value = "sqlite://mail.db?mode=rwc")]
    db: String,

    /// Host the users belong to
    #[arg(long, default_value = "localhost")]
    host: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new user
    Add {
        username: String,
        password: String,
    },
    /// Delete a user and their mail
    Delete {
        username: String,
        password: String,
    },
    /// List all users
    List,
    /// Check whether a user exists
    Exists { username: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let store = MailStore::connect(&cli.db, &cli.host, 1).await?;

    match cli.command {
        Commands::Add { username, password } => {
            store.sign_up(&username, &password).await?;
            println!("User {} added on {}", username, cli.host);
        }
        Commands::Delete { username, password } => {
            store.delete_user(&username, &password).await?;
            println!("User {} deleted", username);
        }
        Commands::List => {
            let users = store.retrieve_user_info("").await?;
            if users.is_empty() {
                println!("No users");
            }
            for user in users {
                println!("{}@{}", user.username, user.host);
            }
        }
        Commands::Exists { username } => {
            if store.user_exists(&username).await? {
                println!("User {} exists", username);
            } else {
                println!("User {} does not exist", username);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
