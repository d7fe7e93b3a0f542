//! OTP Login CLI - Session migrations and notification service checks.
//!
//! # Usage
//!
//! ```bash
//! # Create the sessions table
//! otp-cli migrate
//!
//! # Show configured services and whether each can be built
//! otp-cli services list
//!
//! # Send a test code through a service
//! otp-cli services send --service sms --to +15550109999
//! ```
//!
//! Configuration is read from the same environment variables as the server.

#![cfg_attr(not(test), forbid(unsafe_code))]

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "otp-cli")]
#[command(author, version, about = "OTP login CLI tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the tower-sessions table in `PostgreSQL`
    Migrate,
    /// Inspect and test notification services
    Services {
        #[command(subcommand)]
        action: ServicesAction,
    },
}

#[derive(Subcommand)]
enum ServicesAction {
    /// List configured services
    List,
    /// Send a generated test code through a service
    Send {
        /// Service name from `OTP_SERVICES`
        #[arg(short, long)]
        service: String,

        /// Email address or E.164 phone number
        #[arg(short, long)]
        to: String,
    },
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        tracing::error!("Command failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Migrate => commands::migrate::run().await?,
        Commands::Services { action } => match action {
            ServicesAction::List => commands::services::list()?,
            ServicesAction::Send { service, to } => {
                commands::services::send(&service, &to).await?;
            }
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_services_send() {
        let cli = Cli::try_parse_from([
            "otp-cli", "services", "send", "--service", "sms", "--to", "+15550109999",
        ]);
        assert!(matches!(
            cli.map(|c| c.command),
            Ok(Commands::Services {
                action: ServicesAction::Send { .. }
            })
        ));
    }
}
