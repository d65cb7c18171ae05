use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use drover_queue::Pool;
use drover_worker::daemon;
use drover_worker::handler::{NoopHandler, SleepHandler};
use drover_worker::{Exit, TaskHandlerRegistry, Worker, WorkerConfig};

#[derive(Parser, Debug)]
#[command(name = "drover")]
#[command(about = "Queue worker daemon", long_about = None)]
struct Args {
    /// Queue server address (host:port); repeatable
    #[arg(short, long = "server")]
    server: Vec<String>,

    /// Topic to watch; only its jobs are reserved
    #[arg(short, long)]
    topic: Option<String>,

    /// Path to configuration file
    #[arg(long)]
    config: Option<String>,

    /// Detach into the background
    #[arg(short, long)]
    daemonize: bool,

    /// Where the launcher records the daemon pid
    #[arg(long)]
    pidfile: Option<PathBuf>,

    /// Symlink to watch for redeploys
    #[arg(long)]
    check_symlink: Option<PathBuf>,

    /// Append logs to this file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = if let Some(path) = &args.config {
        WorkerConfig::from_file(path)?
    } else {
        WorkerConfig::default()
    };

    // CLI args override the file
    if !args.server.is_empty() {
        config.servers = args.server;
    }
    if args.topic.is_some() {
        config.topic = args.topic;
    }
    if args.daemonize {
        config.daemonize = true;
    }
    if args.pidfile.is_some() {
        config.pidfile = args.pidfile;
    }
    if args.check_symlink.is_some() {
        config.check_symlink = args.check_symlink;
    }
    if args.log_file.is_some() {
        config.log_file = args.log_file;
    }

    if config.servers.is_empty() {
        anyhow::bail!("no queue servers configured; pass --server or a config file");
    }

    if config.daemonize {
        let pidfile = config
            .pidfile
            .clone()
            .unwrap_or_else(|| PathBuf::from("drover.pid"));
        daemon::detach(&pidfile, move || {
            // Stdout points at the null device from here on; failures only
            // surface through the log file.
            let _ = run_worker(config);
        })?;
        Ok(())
    } else {
        run_worker(config)
    }
}

/// Tracing goes to stdout in the foreground and to the configured log file
/// when there is one. Must run after `detach`, inside the daemon.
fn init_tracing(config: &WorkerConfig) -> anyhow::Result<()> {
    let filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    match &config.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(Arc::new(file)),
                )
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_target(false))
                .init();
        }
    }
    Ok(())
}

fn run_worker(config: WorkerConfig) -> anyhow::Result<()> {
    init_tracing(&config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let exit = runtime.block_on(async {
        let pool = Pool::new(config.servers.clone());

        let registry = TaskHandlerRegistry::new();
        registry.register("noop", NoopHandler);
        registry.register("sleep", SleepHandler::new(1000));
        tracing::info!(task_types = ?registry.task_types(), "registered task handlers");

        let mut worker = Worker::new(config, pool, registry);
        worker.signals().install()?;
        Ok::<_, anyhow::Error>(worker.run().await)
    })?;

    match exit {
        Exit::Stopped => Ok(()),
        Exit::Redeploy(dir) => {
            tracing::info!(dir = %dir.display(), "re-executing from new deployment");
            // The runtime must be gone before the process image is replaced
            drop(runtime);
            Err(daemon::reexec(&dir).into())
        }
    }
}
