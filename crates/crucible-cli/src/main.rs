//! Crucible CLI tool.

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "crucible")]
#[command(about = "Crucible CI/CD CLI", long_about = None)]
struct Cli {
    /// Master server URL
    #[arg(long, env = "CRUCIBLE_API_URL", default_value = "http://localhost:3000")]
    api_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a pipeline file locally
    Validate {
        /// Path to the workflow file
        #[arg(default_value = "crucible.yml")]
        path: String,
    },
    /// Trigger a build for a job
    Trigger {
        /// Job ID
        job: String,
        /// Organization ID
        #[arg(long, env = "CRUCIBLE_ORG_ID")]
        org: String,
        /// Parameters as key=value
        #[arg(short, long)]
        param: Vec<String>,
    },
    /// Manage builds
    Builds {
        #[command(subcommand)]
        command: BuildCommands,
    },
}

#[derive(Subcommand)]
enum BuildCommands {
    /// Show build details
    Show {
        /// Build ID
        id: String,
    },
    /// Follow a build's event stream
    Watch {
        /// Build ID
        id: String,
        /// Replay cursor: only events after this id
        #[arg(long)]
        after: Option<String>,
    },
    /// Cancel a running build
    Cancel {
        /// Build ID
        id: String,
    },
    /// Retry a finished build
    Retry {
        /// Build ID
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
        Commands::Trigger { job, org, param } => {
            commands::trigger(&cli.api_url, &job, &org, &param).await?;
        }
        Commands::Builds { command } => match command {
            BuildCommands::Show { id } => {
                commands::show(&cli.api_url, &id).await?;
            }
            BuildCommands::Watch { id, after } => {
                commands::watch(&cli.api_url, &id, after.as_deref()).await?;
            }
            BuildCommands::Cancel { id } => {
                commands::cancel(&cli.api_url, &id).await?;
            }
            BuildCommands::Retry { id } => {
                commands::retry(&cli.api_url, &id).await?;
            }
        },
    }

    Ok(())
}
