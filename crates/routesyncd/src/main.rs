//! routesyncd - static route synchronization daemon
//!
//! Reads intent events as newline-delimited JSON on stdin, drives them
//! through the reconciler, and keeps the managed kernel table converged
//! until SIGINT/SIGTERM.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use routesyncd::{
    Config, IntentEvent, LogStatusReporter, NetlinkRouteKernel, ReconcileOutcome, Reconciler,
    RouteSyncEngine, StatusReporter,
};

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    info!("--- Starting routesyncd ---");

    match run().await {
        Ok(()) => {
            info!("routesyncd exiting normally");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "routesyncd exiting with error");
            ExitCode::FAILURE
        }
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .init();
}

async fn run() -> anyhow::Result<()> {
    let config = Config::from_env().context("invalid configuration")?;
    info!(
        table = %config.table,
        node = %config.node_hostname,
        protected_subnets = config.protected_subnets.len(),
        "configuration loaded"
    );

    let kernel =
        NetlinkRouteKernel::new(config.kernel_timeout).context("failed to open rtnetlink socket")?;
    let (engine, handle) = RouteSyncEngine::new(&config, kernel);

    let stop = CancellationToken::new();
    let engine_task = tokio::spawn(engine.run(stop.clone()));

    let signal_stop = stop.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_stop.cancel();
    });

    let reconciler = Arc::new(Reconciler::new(&config, handle, LogStatusReporter));
    feed_intents(reconciler, stop.clone(), BufReader::new(tokio::io::stdin())).await?;

    stop.cancel();
    engine_task
        .await
        .context("engine task panicked")?
        .context("engine terminated with error")?;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Consumes newline-delimited JSON intent events until the input closes
/// or shutdown is requested. Each event is delivered on its own task, so
/// an intent sitting in redelivery backoff never stalls the stream.
async fn feed_intents<R, I>(
    reconciler: Arc<Reconciler<R>>,
    stop: CancellationToken,
    input: I,
) -> anyhow::Result<()>
where
    R: StatusReporter + 'static,
    I: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    loop {
        tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            line = lines.next_line() => match line.context("reading intent stream")? {
                None => {
                    info!("intent stream closed");
                    return Ok(());
                }
                Some(line) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<IntentEvent>(line) {
                        Ok(event) => spawn_delivery(reconciler.clone(), stop.clone(), event),
                        Err(e) => warn!(error = %e, "ignoring malformed intent event"),
                    }
                }
            }
        }
    }
}

/// Drives one event to a terminal outcome on its own task, redelivering
/// after the requested delay while the outcome stays transient.
fn spawn_delivery<R: StatusReporter + 'static>(
    reconciler: Arc<Reconciler<R>>,
    stop: CancellationToken,
    event: IntentEvent,
) {
    tokio::spawn(async move {
        loop {
            match reconciler.reconcile(event.clone()).await {
                ReconcileOutcome::Done => return,
                // Already reported through the status seam.
                ReconcileOutcome::Failed(_) => return,
                ReconcileOutcome::Requeue(delay) => {
                    tokio::select! {
                        _ = stop.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    });
}
