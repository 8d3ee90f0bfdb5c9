use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use jobtail::client::WatchClient;
use jobtail::core::{JobId, JobStatus};
use jobtail::logging::{self, LogConfig};
use jobtail::web::{ServerMessage, WebServer};
use jobtail::{config, context, executor};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "jobtail")]
#[command(about = "Live log and progress streaming for backup jobs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default: jobtail.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the streaming daemon
    Serve(ServeArgs),
    /// Follow a job's logs and progress until it finishes
    Watch(WatchArgs),
    /// Print the effective configuration
    Config,
}

#[derive(Args, Serialize)]
struct ServeArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    http_bind: Option<SocketAddr>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    database_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    simulation: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    json_logs: Option<bool>,
}

#[derive(Args)]
struct WatchArgs {
    job_id: JobId,

    /// Daemon HTTP root
    #[arg(long, default_value = "http://127.0.0.1:8750")]
    url: String,

    #[arg(long, env = "JOBTAIL_TOKEN")]
    token: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    let config = match &cli.command {
        Commands::Serve(args) => config::AppConfig::new(config_path, Some(args))?,
        _ => config::AppConfig::new(config_path, None::<&ServeArgs>)?,
    };

    match cli.command {
        Commands::Serve(_) => {
            logging::init(LogConfig::from(&config));
            let ctx = context::AppContext::from_config(config).await?;
            run_server(ctx).await.context("Failed to run daemon")?
        }
        Commands::Watch(args) => {
            logging::init(LogConfig::from(&config));
            run_watch(args).await?
        }
        Commands::Config => print!("{}", config.to_toml()?),
    }

    Ok(())
}

async fn run_server(ctx: context::AppContext) -> Result<()> {
    let server = WebServer::new(ctx.clone(), ctx.config.http_bind);
    let shutdown = server.shutdown_handle();

    let demo = ctx.config.simulation.then(|| {
        tracing::info!("Simulation mode: launching demo jobs");
        executor::spawn_demo_jobs(ctx.registry.clone(), Duration::from_secs(20))
    });

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
            let _ = shutdown.send(());
        }
    });

    let result = server.start().await;
    if let Some(demo) = demo {
        demo.abort();
    }
    result
}

async fn run_watch(args: WatchArgs) -> Result<()> {
    let client = WatchClient::new(args.url, args.token);

    let status = client
        .watch(args.job_id, |msg| match msg {
            ServerMessage::Connected { status } => println!("-- attached, job is {status}"),
            ServerMessage::Log { data } => println!(
                "{} {:<8} {}",
                data.timestamp.format("%H:%M:%S%.3f"),
                data.level.as_str(),
                data.message
            ),
            ServerMessage::Status { status } => println!("-- status: {status}"),
            ServerMessage::Progress { data } => {
                let overall = &data.overall;
                let eta = overall
                    .eta()
                    .map_or_else(|| "--".to_string(), |secs| format!("{secs}s"));
                println!(
                    "-- {} {:.1}% ({}/{} disks) eta {eta}",
                    overall.current_phase.as_str(),
                    overall.percent,
                    (overall.current_disk_index + 1).min(overall.total_disks),
                    overall.total_disks,
                );
            }
            ServerMessage::Complete { status } => println!("-- finished: {status}"),
            ServerMessage::Error { message } => eprintln!("-- stream error: {message}"),
        })
        .await
        .with_context(|| format!("Failed to watch job {}", args.job_id))?;

    if status != JobStatus::Completed {
        std::process::exit(1);
    }
    Ok(())
}
