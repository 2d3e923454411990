//! CLI interface for the KNUE portal client

use anyhow::{bail, Context};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use knue_portal::{
    PortalConfig, PortalHttp, SessionManager, SessionStore, TripOutcome, TripService,
    TripSubmission,
};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "knue-portal")]
#[command(about = "A typed client for the KNUE dormitory web portal")]
#[command(version)]
pub struct Cli {
    /// Directory holding session state between runs
    #[arg(long, default_value = ".knue-portal")]
    state_dir: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Log in to the portal
    Login {
        /// Institutional user id (hakbeon)
        #[arg(short, long)]
        user_no: String,
        /// Password
        #[arg(short, long)]
        password: String,
        /// Do not save credentials for auto-login
        #[arg(long)]
        no_remember: bool,
    },
    /// List submitted trip requests
    List,
    /// Submit a new overnight-stay request
    Submit {
        /// Departure date (YYYY-MM-DD)
        #[arg(short, long)]
        start: String,
        /// Return date (YYYY-MM-DD)
        #[arg(short, long)]
        end: String,
    },
    /// Cancel a submitted request by its sequence id
    Cancel {
        #[arg(short, long)]
        seq: String,
    },
    /// Log out and clear the local session
    Logout {
        /// Also delete saved credentials
        #[arg(long)]
        clear_credentials: bool,
    },
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("knue_portal=info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    let store = SessionStore::at(&cli.state_dir);
    let http = PortalHttp::new(PortalConfig::default(), store.clone()).await?;
    let session = SessionManager::new(http.clone(), store.clone());

    match cli.command {
        Commands::Login {
            user_no,
            password,
            no_remember,
        } => {
            if session.login(&user_no, &password, !no_remember).await {
                println!("Logged in as {}", user_no);
            } else {
                bail!("login failed");
            }
        }
        Commands::List => {
            let trips = TripService::new(http, store)?
                .fetch_trip_list()
                .await
                .context("failed to fetch trip list")?;
            if trips.is_empty() {
                println!("No trip requests found.");
            }
            for trip in trips {
                println!(
                    "#{} {} ~ {}  {}  {} ({})",
                    trip.seq,
                    trip.start_date,
                    trip.end_date,
                    trip.trip_type,
                    trip.target_place,
                    trip.status
                );
            }
        }
        Commands::Submit { start, end } => {
            let submission = TripSubmission {
                start_date: parse_date(&start)?,
                end_date: parse_date(&end)?,
            };
            let result = TripService::new(http, store)?.submit(&submission).await;
            report(&result.outcome, result.trips.len())?;
        }
        Commands::Cancel { seq } => {
            let service = TripService::new(http, store)?;
            let trips = service
                .fetch_trip_list()
                .await
                .context("failed to fetch trip list")?;
            let item = trips
                .iter()
                .find(|t| t.seq == seq)
                .with_context(|| format!("no trip request with seq {}", seq))?;
            let result = service.cancel(item).await;
            report(&result.outcome, result.trips.len())?;
        }
        Commands::Logout { clear_credentials } => {
            if session.logout(clear_credentials).await {
                println!("Logged out.");
            } else {
                bail!("logout failed to clear local state");
            }
        }
    }

    Ok(())
}

fn parse_date(raw: &str) -> anyhow::Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("invalid date {:?}, expected YYYY-MM-DD", raw))
}

fn report(outcome: &TripOutcome, trips: usize) -> anyhow::Result<()> {
    match outcome {
        TripOutcome::Confirmed(signal) => {
            println!("Confirmed ({:?}). {} request(s) on record.", signal, trips);
            Ok(())
        }
        TripOutcome::Unconfirmed => {
            println!(
                "Processed but not confirmed by the portal; {} request(s) on record — please re-check.",
                trips
            );
            Ok(())
        }
        TripOutcome::Rejected(violation) => bail!("{}", violation),
        TripOutcome::Failed(message) => bail!("request failed: {}", message),
    }
}
