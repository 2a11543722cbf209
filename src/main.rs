//! bucket-loader - Coordinated two-phase replication
//!
//! Entry point for the CLI application.

use anyhow::{Context, Result};
use clap::Parser;
use bucket_loader::archive::LocalArchive;
use bucket_loader::config::{queue_config, CliArgs, Command, MasterArgs, OrchestratorConfig, WorkerArgs, WorkerConfig};
use bucket_loader::control::{Identity, RedisControlChannel};
use bucket_loader::coordinator::{Collaborators, Orchestrator, RunOutcome};
use bucket_loader::error::LoaderError;
use bucket_loader::progress::{print_header, print_run_summary, print_worker_summary, ProgressReporter};
use bucket_loader::queue::{RedisWorkQueue, WorkQueue};
use bucket_loader::worker::{ProcessRunner, TaskExecutor, WorkerNode};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    // Parse CLI arguments
    let args = CliArgs::parse();

    // Setup logging
    setup_logging(args.verbose)?;

    // First Ctrl-C stops gracefully, the second forces exit
    let shutdown = CancellationToken::new();
    let interrupted = Arc::new(AtomicBool::new(false));
    let handler_token = shutdown.clone();
    ctrlc::set_handler(move || {
        if interrupted.swap(true, Ordering::SeqCst) {
            eprintln!("\nForce shutdown!");
            std::process::exit(130);
        }
        eprintln!("\nInterrupt received, shutting down... (press Ctrl+C again to force)");
        handler_token.cancel();
    })
    .context("Failed to set signal handler")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(async {
        match &args.command {
            Command::Master(master) => run_master(&args, master, shutdown).await,
            Command::Worker(worker) => run_worker(&args, worker, shutdown).await,
            Command::Purge => run_purge(&args).await,
        }
    })
}

async fn run_master(args: &CliArgs, master: &MasterArgs, shutdown: CancellationToken) -> Result<()> {
    let config = OrchestratorConfig::from_master_args(master).context("Invalid configuration")?;
    let source = config.source.build(None).context("Invalid manifest source")?;

    if !args.quiet {
        print_header(
            "master",
            &args.redis,
            &format!("Workers: {} | Source: {}", config.expected_workers, source.describe()),
        );
    }

    let control = RedisControlChannel::connect(
        &args.redis,
        &args.control_channel,
        Identity::orchestrator(&config.source_id, &config.address),
    )
    .await
    .context("Failed to connect control channel")?;
    let queue = RedisWorkQueue::new(queue_config(args))
        .await
        .context("Failed to connect work queue")?;
    let runner = ProcessRunner::new(config.command_timeout);

    let orchestrator = Orchestrator::new(
        config,
        Collaborators {
            control: Arc::new(control),
            queue: Arc::new(queue),
            source,
            archive: Arc::new(LocalArchive::new(&master.archive_dir)),
            runner: Arc::new(runner),
            // Workers are started externally
            provider: None,
        },
    );

    let handle = orchestrator.start().await.context("Failed to start orchestrator")?;

    let outcome = tokio::select! {
        outcome = handle.terminated() => outcome,
        () = shutdown.cancelled() => {
            orchestrator.destroy().await;
            if !args.quiet {
                print_run_summary(&orchestrator.summary());
            }
            return Err(LoaderError::Interrupted.into());
        }
    };

    if !args.quiet {
        print_run_summary(&orchestrator.summary());
    }

    match outcome {
        RunOutcome::Completed => {
            info!("Run completed");
            Ok(())
        }
        RunOutcome::Failed(reason) => anyhow::bail!("Run failed: {}", reason),
        RunOutcome::Running => Ok(()),
    }
}

async fn run_worker(args: &CliArgs, worker: &WorkerArgs, shutdown: CancellationToken) -> Result<()> {
    let config = WorkerConfig::from_worker_args(worker).context("Invalid configuration")?;

    if !args.quiet {
        print_header(
            "worker",
            &args.redis,
            &format!(
                "Address: {} | {} -> {}",
                config.address,
                config.executor.source_root.display(),
                config.executor.target_root.display()
            ),
        );
    }

    let control = RedisControlChannel::connect(
        &args.redis,
        &args.control_channel,
        Identity::worker(&config.worker_id, &config.address),
    )
    .await
    .context("Failed to connect control channel")?;
    let queue = RedisWorkQueue::new(queue_config(args))
        .await
        .context("Failed to connect work queue")?;

    let executor = TaskExecutor::new(
        config.executor.clone(),
        Arc::new(ProcessRunner::new(config.command_timeout)),
    );
    let node = Arc::new(WorkerNode::new(
        config.node.clone(),
        Arc::new(control),
        Arc::new(queue),
        executor,
        Arc::new(LocalArchive::new(&config.archive_dir)),
    ));

    let stopper = Arc::clone(&node);
    tokio::spawn(async move {
        shutdown.cancelled().await;
        stopper.stop();
    });

    let progress = if args.quiet { None } else { Some(ProgressReporter::new()) };
    if let Some(ref p) = progress {
        p.set_status("Waiting for orchestrator...");
    }

    let stats = node
        .run(|update| {
            if let Some(ref p) = progress {
                p.update(update);
            }
        })
        .await?;

    if let Some(ref p) = progress {
        p.finish_and_clear();
    }
    if !args.quiet {
        print_worker_summary(&config.address, &stats);
    }
    Ok(())
}

async fn run_purge(args: &CliArgs) -> Result<()> {
    let queue = RedisWorkQueue::new(queue_config(args))
        .await
        .context("Failed to connect work queue")?;
    let purged = queue.purge().await?;
    queue.close().await?;

    info!(purged, "Work queue purged");
    if !args.quiet {
        println!("Purged {} queued work items", purged);
    }
    Ok(())
}

fn setup_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("bucket_loader=debug,warn")
    } else {
        EnvFilter::new("bucket_loader=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    Ok(())
}
