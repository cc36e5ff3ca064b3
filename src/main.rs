//! rje — remote job executor: server and client in a single binary.
//!
//! Logs always go to stderr; stdout is reserved for command results (job
//! ids, status lines, streamed output), matching the original CLI.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tonic::transport::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rje::core::{Authorizer, CGroupManager, JobSupervisor};
use rje::rpc::pb::jobs_service_client::JobsServiceClient;
use rje::rpc::pb::{JobIdRequest, JobStartRequest, JobStartStatus, JobStatus};
use rje::rpc::server::Service;

#[derive(Debug, Parser)]
#[command(name = "rje")]
#[command(about = "Mutually-authenticated remote job executor", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv); logs go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

/// TLS material shared by every client subcommand.
#[derive(Debug, clap::Args)]
struct ClientTls {
    /// Server address, e.g. https://host:4443.
    #[arg(short = 's', long)]
    server: String,

    /// CA certificate trusted for both directions.
    #[arg(short = 'a', long = "ca")]
    ca: PathBuf,

    /// Client certificate.
    #[arg(short = 'c', long = "cert")]
    cert: PathBuf,

    /// Client private key.
    #[arg(short = 'k', long = "key")]
    key: PathBuf,

    /// Expected server name for TLS verification.
    #[arg(long, default_value = "localhost")]
    server_name: String,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the server.
    Serve {
        /// Port to listen on.
        #[arg(short = 'p', long)]
        port: u16,

        /// CA certificate used to verify client certificates.
        #[arg(short = 'a', long = "ca")]
        ca: PathBuf,

        /// Server certificate.
        #[arg(short = 'c', long = "cert")]
        cert: PathBuf,

        /// Server private key.
        #[arg(short = 'k', long = "key")]
        key: PathBuf,

        /// Run jobs without cgroup resource isolation.
        #[arg(short = 's', long = "skip-cgroups")]
        skip_cgroups: bool,
    },

    /// Start a command on the server.
    Start {
        #[command(flatten)]
        tls: ClientTls,

        /// Command and arguments to run remotely.
        #[arg(required = true, trailing_var_arg = true, last = true)]
        command: Vec<String>,
    },

    /// Stop a running job.
    Stop {
        #[command(flatten)]
        tls: ClientTls,

        #[arg(short = 'j', long = "job-id")]
        job_id: String,
    },

    /// Query a job's status.
    Status {
        #[command(flatten)]
        tls: ClientTls,

        #[arg(short = 'j', long = "job-id")]
        job_id: String,
    },

    /// Follow a job's combined stdout/stderr.
    Tail {
        #[command(flatten)]
        tls: ClientTls,

        #[arg(short = 'j', long = "job-id")]
        job_id: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    if let Err(e) = run(cli.command).await {
        if let Some(status) = e.downcast_ref::<tonic::Status>() {
            eprintln!("rpc error ({:?}): {}", status.code(), status.message());
        } else {
            eprintln!("error: {e:#}");
        }
        std::process::exit(1);
    }
}

async fn run(command: Command) -> Result<()> {
    match command {
        Command::Serve { port, ca, cert, key, skip_cgroups } => serve(port, ca, cert, key, skip_cgroups).await,
        Command::Start { tls, command } => start(tls, command).await,
        Command::Stop { tls, job_id } => stop(tls, job_id).await,
        Command::Status { tls, job_id } => status(tls, job_id).await,
        Command::Tail { tls, job_id } => tail(tls, job_id).await,
    }
}

async fn serve(port: u16, ca: PathBuf, cert: PathBuf, key: PathBuf, skip_cgroups: bool) -> Result<()> {
    let cgroups = if skip_cgroups {
        info!("running without cgroup resource isolation");
        None
    } else {
        let manager = CGroupManager::new();
        manager
            .check_support()
            .context("host does not support the required cgroup v2 controllers")?;
        manager
            .ensure_parent()
            .context("creating the parent cgroup")?;
        Some(manager)
    };

    let supervisor = Arc::new(JobSupervisor::new(cgroups));
    let authorizer = Arc::new(Authorizer::with_default_table());
    let service = Service::new(supervisor.clone(), authorizer);

    let tls = rje::rpc::tls::server_config(&cert, &key, &ca)
        .await
        .context("loading server TLS credentials")?;

    let addr: SocketAddr = format!("0.0.0.0:{port}").parse().context("invalid port")?;
    info!(%addr, "rje server listening");

    Server::builder()
        .tls_config(tls)
        .context("configuring server TLS")?
        .add_service(rje::rpc::pb::jobs_service_server::JobsServiceServer::new(service))
        .serve_with_shutdown(addr, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received, stopping jobs");
        })
        .await
        .context("server error")?;

    supervisor.cleanup();
    Ok(())
}

async fn start(tls: ClientTls, command: Vec<String>) -> Result<()> {
    let mut client = connect(&tls).await?;
    let response = client
        .start(JobStartRequest { command })
        .await
        .context("start rpc failed")?
        .into_inner();

    match JobStartStatus::try_from(response.status).unwrap_or(JobStartStatus::Unspecified) {
        JobStartStatus::Running => println!("{}\trunning", response.job_id),
        JobStartStatus::ExitedInstantly => println!("{}\texited instantly", response.job_id),
        JobStartStatus::CommandNotFound => println!("command not found"),
        JobStartStatus::Unspecified => println!("{}\tunknown", response.job_id),
    }
    Ok(())
}

async fn stop(tls: ClientTls, job_id: String) -> Result<()> {
    let mut client = connect(&tls).await?;
    let response = client
        .stop(JobIdRequest { job_id })
        .await
        .context("stop rpc failed")?
        .into_inner();
    println!("exit_code={}\tforced={}", response.exit_code, response.force_ended);
    Ok(())
}

async fn status(tls: ClientTls, job_id: String) -> Result<()> {
    let mut client = connect(&tls).await?;
    let response = client
        .status(JobIdRequest { job_id })
        .await
        .context("status rpc failed")?
        .into_inner();

    let status = JobStatus::try_from(response.job_status).unwrap_or(JobStatus::Unspecified);
    println!("exit_code={}\tstatus={status:?}", response.exit_code);
    Ok(())
}

async fn tail(tls: ClientTls, job_id: String) -> Result<()> {
    use tokio_stream::StreamExt;

    let mut client = connect(&tls).await?;
    let mut stream = client
        .tail(JobIdRequest { job_id })
        .await
        .context("tail rpc failed")?
        .into_inner();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("tail stream error")?;
        use std::io::Write;
        std::io::stdout().write_all(&chunk.message).ok();
        std::io::stdout().flush().ok();
    }
    Ok(())
}

async fn connect(tls: &ClientTls) -> Result<JobsServiceClient<tonic::transport::Channel>> {
    rje::rpc::client::connect(&tls.server, &tls.cert, &tls.key, &tls.ca, &tls.server_name)
        .await
        .context("connecting to server")
}
