//! backup-ctl - remote control for a running backup-jobs service.

use anyhow::{Context, Result};
use backup_jobs::remote::{CommandKind, JobStatusDto, RemoteClient, RemoteCommand};
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "backup-ctl")]
#[command(version)]
#[command(about = "Monitor and drive backup jobs over the remote-control port")]
struct Args {
    /// Service address
    #[arg(long, value_name = "HOST:PORT", default_value = "127.0.0.1:9000")]
    addr: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the current job status once
    Status,
    /// Keep printing status updates
    Watch,
    /// Start a job
    Run { job: String },
    /// Start every idle job
    Runall,
    /// Pause a running job
    Pause { job: String },
    /// Resume a paused job
    Resume { job: String },
    /// Stop a job and reset it to PENDING
    Stop { job: String },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut client = RemoteClient::connect(&args.addr)
        .await
        .with_context(|| format!("cannot connect to {}", args.addr))?;

    // The server always opens with a snapshot.
    let initial = client.next_status().await?;

    let command = match args.command {
        Command::Status => {
            print_status(&initial);
            return Ok(());
        }
        Command::Watch => {
            print_status(&initial);
            loop {
                let statuses = client.next_status().await?;
                println!();
                print_status(&statuses);
            }
        }
        Command::Run { job } => RemoteCommand::new(CommandKind::Run, job),
        Command::Runall => RemoteCommand::run_all(),
        Command::Pause { job } => RemoteCommand::new(CommandKind::Pause, job),
        Command::Resume { job } => RemoteCommand::new(CommandKind::Resume, job),
        Command::Stop { job } => RemoteCommand::new(CommandKind::Stop, job),
    };

    client.send(&command).await?;
    // Commands are fire-and-forget; show the state that follows.
    let statuses = client.next_status().await?;
    print_status(&statuses);
    Ok(())
}

fn print_status(statuses: &[JobStatusDto]) {
    if statuses.is_empty() {
        println!("no jobs registered");
        return;
    }
    println!("{:<24} {:<13} {:<10} {:>8}  LAST RUN", "NAME", "TYPE", "STATE", "PROGRESS");
    for status in statuses {
        let last_run = status
            .last_run_time
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<24} {:<13} {:<10} {:>7.1}%  {}",
            status.name,
            status.backup_type.to_string(),
            status.state.to_string(),
            status.progress,
            last_run
        );
    }
}
