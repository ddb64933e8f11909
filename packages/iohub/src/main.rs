use anyhow::Context;
use clap::Parser;
use iohub::client::{FAILED_LINE, READY_LINE};
use iohub::{scheduler, timebase, BatchingSink, HubConfig, HubServer, JsonLinesSink, RpcTable};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "iohub-server", version, about = "Low-latency local event hub")]
struct Cli {
    /// YAML or JSON configuration file
    #[arg(long, env = "IOHUB_CONFIG")]
    config: Option<PathBuf>,

    /// Raw monotonic reading that hub time is measured from (defaults to now)
    #[arg(long, allow_negative_numbers = true)]
    epoch_offset: Option<f64>,

    /// Override the configured request port
    #[arg(long)]
    port: Option<u16>,
}

mod exit {
    pub const GENERAL: u8 = 1;
    pub const BIND: u8 = 2;
    pub const PERSISTENCE: u8 = 3;
    pub const CONFIG: u8 = 4;
}

/// A fatal error and the exit code reported for it
struct Fatal {
    code: u8,
    error: anyhow::Error,
}

trait OrExit<T> {
    fn or_exit(self, code: u8) -> Result<T, Fatal>;
}

impl<T, E: Into<anyhow::Error>> OrExit<T> for Result<T, E> {
    fn or_exit(self, code: u8) -> Result<T, Fatal> {
        self.map_err(|e| Fatal {
            code,
            error: e.into(),
        })
    }
}

fn main() -> ExitCode {
    // stdout carries the status line; logs go to stderr
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "iohub=info,iohub_server=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let result = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building runtime")
        .or_exit(exit::GENERAL)
        .and_then(|runtime| runtime.block_on(run(cli)));

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(fatal) => {
            tracing::error!(error = %format!("{:#}", fatal.error), code = fatal.code, "Hub failed");
            println!("{} {:#}", FAILED_LINE, fatal.error);
            let _ = std::io::stdout().flush();
            ExitCode::from(fatal.code)
        }
    }
}

async fn run(cli: Cli) -> Result<(), Fatal> {
    let mut config = HubConfig::load(cli.config.as_deref())
        .context("loading configuration")
        .or_exit(exit::CONFIG)?;
    if let Some(port) = cli.port {
        config.port = port;
        config.validate().or_exit(exit::CONFIG)?;
    }

    let offset = cli.epoch_offset.unwrap_or_else(timebase::raw_monotonic_secs);
    let clock = *timebase::install(offset).or_exit(exit::CONFIG)?;
    tracing::info!(epoch_offset = offset, "Timebase installed");

    let mut builder = config
        .hub_builder(clock)
        .context("creating devices")
        .or_exit(exit::CONFIG)?;
    if let Some(path) = &config.data_file {
        let sink = JsonLinesSink::open(path)
            .with_context(|| format!("opening data file {}", path.display()))
            .or_exit(exit::PERSISTENCE)?;
        builder = builder.sink(BatchingSink::new(Box::new(sink), config.flush_every));
    }
    let hub = Arc::new(builder.build().or_exit(exit::CONFIG)?);

    let addr = config.bind_address().or_exit(exit::CONFIG)?;
    let server = HubServer::bind(addr, Arc::clone(&hub), RpcTable::default(), config.max_datagram_bytes)
        .await
        .with_context(|| format!("binding {}", addr))
        .or_exit(exit::BIND)?;
    let local = server.local_addr().or_exit(exit::BIND)?;

    let cancel = hub.shutdown_token();
    let pollers = scheduler::spawn_pollers(&hub, &cancel);
    let merge = scheduler::spawn_merge(&hub, config.merge_interval(), &cancel);
    tokio::spawn(cancel_on_signal(cancel.clone()));

    println!("{} {}", READY_LINE, local);
    let _ = std::io::stdout().flush();
    tracing::info!(
        addr = %local,
        devices = hub.devices().len(),
        pollers = pollers.len(),
        persisting = hub.has_sink(),
        "Hub running"
    );

    let served = server.run(cancel.clone()).await;
    cancel.cancel();

    for poller in pollers {
        if let Err(e) = poller.await {
            tracing::warn!(error = %e, "Poller task ended abnormally");
        }
    }
    let merged = merge.await;
    let closed = hub.close();

    served.context("serving requests").or_exit(exit::GENERAL)?;
    merged
        .context("merge task panicked")
        .or_exit(exit::GENERAL)?
        .context("persisting events")
        .or_exit(exit::PERSISTENCE)?;
    closed.context("closing data store").or_exit(exit::PERSISTENCE)
}

async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = cancel.cancelled() => return,
        Ok(()) = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }
    tracing::info!("Shutdown signal received");
    cancel.cancel();
}
