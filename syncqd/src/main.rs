//! `syncqd` pushes directory changes to a remote provider at a pace its API tolerates.
//!
//! # Usage
//!
//! ```bash
//! # Run the daemon until SIGTERM or SIGINT
//! syncqd --config-file /etc/syncqd/syncqd.conf --pid-file /run/syncqd.pid run
//!
//! # Queue a change for a user
//! syncqd enqueue --kind user.update --target jdoe --payload '{"mail": "jdoe@example.org"}'
//!
//! # Show the jobs that gave up
//! syncqd list --state hard_failed
//! ```
use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use syncq::{
    backend::{Backend, Query},
    job::{builder::JobBuilder, JobClass, JobState},
};
use syncq_sqlx::SqliteBackend;

mod config;
mod daemon;
mod logging;
mod pidfile;
mod provider;
#[cfg(test)]
mod test_server;
mod worker;

use config::DaemonConfig;
use pidfile::PidFile;

#[derive(Debug, Parser)]
#[command(name = "syncqd", version, about = "Directory synchronisation daemon")]
struct Cli {
    /// INI configuration file
    #[arg(short, long, default_value = "/etc/syncqd/syncqd.conf")]
    config_file: PathBuf,

    /// Write the process id to this file while running
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Also log to stderr when a log file is configured
    #[arg(long)]
    log_to_stderr: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the job queue until asked to stop
    Run,
    /// Submit a single job
    Enqueue(EnqueueArgs),
    /// Print stored jobs
    List(ListArgs),
}

#[derive(Debug, Args)]
struct EnqueueArgs {
    #[arg(long)]
    kind: String,
    #[arg(long)]
    target: String,
    /// immediate, normal or offline
    #[arg(long, default_value = "normal", value_parser = parse_class)]
    class: JobClass,
    /// JSON payload handed to the provider
    #[arg(long)]
    payload: Option<String>,
    /// The job only reads from the provider and runs in read-only mode too
    #[arg(long)]
    non_mutating: bool,
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(long, value_parser = parse_state)]
    state: Option<JobState>,
}

fn parse_class(value: &str) -> Result<JobClass, syncq::job::JobError> {
    value.parse()
}

fn parse_state(value: &str) -> Result<JobState, syncq::job::JobError> {
    value.parse()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = DaemonConfig::load(&cli.config_file)?;

    match cli.command {
        Commands::Run => {
            logging::init(config.logfile(), cli.log_to_stderr)?;
            let _pid_file = cli.pid_file.as_deref().map(PidFile::create).transpose()?;
            daemon::run(config).await
        }
        Commands::Enqueue(args) => {
            logging::init(None, true)?;
            let id = enqueue(&config, args).await?;
            println!("{}", i64::from(id));
            Ok(())
        }
        Commands::List(args) => {
            logging::init(None, true)?;
            for job in list(&config, args).await? {
                println!("{job}");
            }
            Ok(())
        }
    }
}

async fn open_store(config: &DaemonConfig) -> anyhow::Result<SqliteBackend> {
    SqliteBackend::connect(&config.database.url)
        .await
        .with_context(|| format!("failed to open job store {}", config.database.url))
}

async fn enqueue(config: &DaemonConfig, args: EnqueueArgs) -> anyhow::Result<syncq::job::JobId> {
    let mut builder = JobBuilder::new(args.kind, args.target).with_class(args.class);
    if let Some(payload) = args.payload {
        let payload = serde_json::from_str(&payload).context("payload is not valid JSON")?;
        builder = builder.with_payload(payload);
    }
    if args.non_mutating {
        builder = builder.non_mutating();
    }

    let backend = open_store(config).await?;
    let id = backend.enqueue(builder.build()).await?;
    backend.close().await;
    Ok(id)
}

async fn list(config: &DaemonConfig, args: ListArgs) -> anyhow::Result<Vec<syncq::job::Job>> {
    let query = match args.state {
        Some(state) => Query::StateEqual(state),
        None => Query::And(Vec::new()),
    };
    let backend = open_store(config).await?;
    let jobs = backend.query(query).await?;
    backend.close().await;
    Ok(jobs)
}
