//! Route synchronization engine
//!
//! The engine is the sole writer of its kernel routing table. Every
//! mutation funnels through one serialized command queue consumed by
//! [`RouteSyncEngine::run`]; a periodic reconciliation tick re-reads the
//! table and heals drift caused by external actors. Transient kernel
//! failures are retried with bounded backoff before surfacing to the
//! submitter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ipnet::IpNet;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::{Config, RetryPolicy};
use crate::error::{Result, RoutesyncError};
use crate::guard::ProtectedSubnets;
use crate::netlink::{KernelRoute, RouteKernel};
use crate::resolver;
use crate::types::{ResolvedRoute, RouteCommand, TableId};

const STATE_IDLE: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// Engine lifecycle: `Idle → Running → Stopped`, never backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Running,
    Stopped,
}

impl EngineState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            STATE_RUNNING => EngineState::Running,
            STATE_STOPPED => EngineState::Stopped,
            _ => EngineState::Idle,
        }
    }
}

struct QueuedCommand {
    command: RouteCommand,
    done: oneshot::Sender<Result<()>>,
}

/// Awaitable terminal outcome of a submitted command.
///
/// `submit` itself never blocks; the ticket resolves once the engine has
/// applied, rejected, or discarded the command.
#[derive(Debug)]
pub struct CommandTicket {
    outcome: oneshot::Receiver<Result<()>>,
}

impl CommandTicket {
    pub async fn outcome(self) -> Result<()> {
        match self.outcome.await {
            Ok(result) => result,
            // The engine dropped the command without applying it.
            Err(_) => Err(RoutesyncError::Cancelled),
        }
    }
}

/// Cheaply cloneable submission side of the engine queue.
///
/// Safe for concurrent callers; submission only enqueues.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<QueuedCommand>,
    state: Arc<AtomicU8>,
}

impl EngineHandle {
    /// Enqueues a command for serialized application.
    ///
    /// Fails only with [`RoutesyncError::EngineStopped`] once the engine
    /// has shut down.
    pub fn submit(&self, command: RouteCommand) -> Result<CommandTicket> {
        if self.state.load(Ordering::SeqCst) == STATE_STOPPED {
            return Err(RoutesyncError::EngineStopped);
        }
        let (done, outcome) = oneshot::channel();
        self.tx
            .send(QueuedCommand { command, done })
            .map_err(|_| RoutesyncError::EngineStopped)?;
        Ok(CommandTicket { outcome })
    }

    pub fn state(&self) -> EngineState {
        EngineState::from_raw(self.state.load(Ordering::SeqCst))
    }
}

/// Owns a kernel routing table and applies route commands in submission
/// order.
pub struct RouteSyncEngine<K> {
    kernel: K,
    guard: ProtectedSubnets,
    table: TableId,
    reconcile_interval: Duration,
    retry: RetryPolicy,
    /// Last-submitted desired state, keyed by destination. One entry per
    /// (destination, table) by construction.
    desired: HashMap<IpNet, ResolvedRoute>,
    rx: mpsc::UnboundedReceiver<QueuedCommand>,
    state: Arc<AtomicU8>,
}

enum WriteOp {
    Replace,
    Delete,
}

impl<K: RouteKernel> RouteSyncEngine<K> {
    /// Creates the engine and its submission handle.
    pub fn new(config: &Config, kernel: K) -> (Self, EngineHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(AtomicU8::new(STATE_IDLE));
        let engine = Self {
            kernel,
            guard: ProtectedSubnets::new(config.protected_subnets.clone()),
            table: config.table,
            reconcile_interval: config.reconcile_interval,
            retry: config.retry,
            desired: HashMap::new(),
            rx,
            state: state.clone(),
        };
        let handle = EngineHandle { tx, state };
        (engine, handle)
    }

    /// Blocking entry point; consumes the engine so it runs exactly once.
    ///
    /// Applies queued commands strictly in submission order and runs the
    /// periodic drift-healing pass until the stop signal fires. Commands
    /// still queued at stop are discarded and reported as cancelled.
    #[instrument(skip_all, fields(table = %self.table))]
    pub async fn run(mut self, stop: CancellationToken) -> Result<()> {
        self.state.store(STATE_RUNNING, Ordering::SeqCst);
        info!(
            interval_secs = self.reconcile_interval.as_secs(),
            protected = self.guard.len(),
            "route sync engine running"
        );

        let mut tick = tokio::time::interval(self.reconcile_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    info!("stop signal received");
                    break;
                }
                queued = self.rx.recv() => match queued {
                    Some(queued) => {
                        let result = self.apply(queued.command).await;
                        if let Err(e) = &result {
                            warn!(error = %e, "command failed");
                        }
                        // Submitter may have given up on the outcome.
                        let _ = queued.done.send(result);
                    }
                    None => {
                        info!("all submitters dropped, shutting down");
                        break;
                    }
                },
                _ = tick.tick() => {
                    if let Err(e) = self.reconcile().await {
                        warn!(error = %e, "reconciliation pass failed");
                    }
                }
            }
        }

        self.state.store(STATE_STOPPED, Ordering::SeqCst);
        self.rx.close();
        let mut discarded = 0usize;
        while let Ok(queued) = self.rx.try_recv() {
            let _ = queued.done.send(Err(RoutesyncError::Cancelled));
            discarded += 1;
        }
        if discarded > 0 {
            warn!(discarded, "discarded queued commands at shutdown");
        }
        info!("route sync engine stopped");
        Ok(())
    }

    async fn apply(&mut self, command: RouteCommand) -> Result<()> {
        match command {
            RouteCommand::Add(route) => self.apply_add(route).await,
            RouteCommand::Delete(route) => self.apply_delete(route).await,
        }
    }

    async fn apply_add(&mut self, mut route: ResolvedRoute) -> Result<()> {
        if let Some(subnet) = self.guard.find_overlap(&route.destination) {
            return Err(RoutesyncError::ProtectedSubnet {
                destination: route.destination,
                subnet: *subnet,
            });
        }

        if route.gateway.is_none() {
            let hop = resolver::resolve(&mut self.kernel, route.destination.network()).await?;
            route.gateway = hop.gateway;
            route.oif = hop.oif;
        }

        self.write_with_retry(WriteOp::Replace, &route).await?;
        info!(route = %route, "installed route");
        self.desired.insert(route.destination, route);
        Ok(())
    }

    async fn apply_delete(&mut self, route: ResolvedRoute) -> Result<()> {
        self.write_with_retry(WriteOp::Delete, &route).await?;
        info!(destination = %route.destination, table = %route.table, "removed route");
        self.desired.remove(&route.destination);
        Ok(())
    }

    /// Applies one kernel write, retrying transient failures with bounded
    /// backoff. Non-transient errors surface immediately.
    async fn write_with_retry(&mut self, op: WriteOp, route: &ResolvedRoute) -> Result<()> {
        let mut retry = 0u32;
        loop {
            let result = match op {
                WriteOp::Replace => self.kernel.replace_route(route).await,
                WriteOp::Delete => self.kernel.delete_route(route).await,
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && retry + 1 < self.retry.max_attempts => {
                    let delay = self.retry.backoff(retry);
                    warn!(
                        error = %e,
                        retry,
                        delay_ms = delay.as_millis() as u64,
                        "transient kernel failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Drift-healing pass: re-derives the managed table from the desired
    /// set, restoring entries removed externally and deleting static
    /// entries no longer desired.
    async fn reconcile(&mut self) -> Result<()> {
        let actual = self.kernel.list_routes(self.table).await?;
        let by_destination: HashMap<IpNet, &KernelRoute> =
            actual.iter().map(|r| (r.destination, r)).collect();

        let mut restored = 0usize;
        let wanted: Vec<ResolvedRoute> = self.desired.values().cloned().collect();
        for want in wanted {
            let drifted = match by_destination.get(&want.destination) {
                None => true,
                Some(have) => have.gateway != want.gateway,
            };
            if drifted {
                match self.write_with_retry(WriteOp::Replace, &want).await {
                    Ok(()) => {
                        restored += 1;
                        info!(route = %want, "restored drifted route");
                    }
                    Err(e) => warn!(route = %want, error = %e, "failed to restore route"),
                }
            }
        }

        let mut removed = 0usize;
        for have in &actual {
            if !have.protocol_static || self.desired.contains_key(&have.destination) {
                continue;
            }
            let target = ResolvedRoute {
                destination: have.destination,
                gateway: None,
                table: self.table,
                oif: None,
            };
            match self.write_with_retry(WriteOp::Delete, &target).await {
                Ok(()) => {
                    removed += 1;
                    info!(destination = %have.destination, "removed undesired route");
                }
                Err(e) => warn!(destination = %have.destination, error = %e, "failed to remove route"),
            }
        }

        if restored > 0 || removed > 0 {
            debug!(restored, removed, "reconciliation tick healed drift");
        }
        Ok(())
    }
}
