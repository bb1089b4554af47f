use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use yaef_sync::SyncTarget;

#[derive(Debug, Parser)]
#[command(name = "yaef")]
#[command(about = "Earnings and economic calendar feed")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch calendars once and merge them into the data directory.
    Sync {
        #[arg(value_enum, default_value_t = Calendar::All)]
        calendar: Calendar,
    },
    /// Serve the calendar API and run the sync scheduler.
    Serve,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Calendar {
    Earnings,
    Economics,
    All,
}

impl From<Calendar> for SyncTarget {
    fn from(calendar: Calendar) -> Self {
        match calendar {
            Calendar::Earnings => SyncTarget::Earnings,
            Calendar::Economics => SyncTarget::Economics,
            Calendar::All => SyncTarget::All,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Sync {
        calendar: Calendar::All,
    }) {
        Commands::Sync { calendar } => {
            let report = yaef_sync::run_sync_from_env(calendar.into()).await?;
            report.log();
            println!("{}", serde_json::to_string_pretty(&report.statuses())?);
            if report
                .results
                .iter()
                .any(|(_, result)| matches!(result, Err(err) if !err.is_empty_result()))
            {
                bail!("one or more calendars failed to sync");
            }
        }
        Commands::Serve => yaef_web::serve_from_env().await?,
    }

    Ok(())
}
