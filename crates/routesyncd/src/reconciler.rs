//! Intent reconciliation
//!
//! Translates intent lifecycle events from the external watch boundary
//! into engine commands, classifies each terminal outcome as done,
//! requeue-later, or permanently failed, and reports per-intent status
//! through the [`StatusReporter`] seam.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::engine::EngineHandle;
use crate::error::{Result, RoutesyncError};
use crate::types::{ResolvedRoute, RouteCommand, RouteIntent, TableId};

/// Intent change delivered by the watch boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IntentEvent {
    Upserted(RouteIntent),
    /// Carries the name of the removed intent.
    Deleted(String),
}

/// Terminal result of one reconciliation pass.
#[derive(Debug)]
pub enum ReconcileOutcome {
    /// Converged; nothing further to do for this event.
    Done,
    /// Transient trouble; redeliver the event after the delay.
    Requeue(Duration),
    /// Permanent; redelivery cannot help.
    Failed(RoutesyncError),
}

/// Posts per-intent status back to whatever owns the intent records.
#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn report_applied(&self, intent: &RouteIntent, route: &ResolvedRoute);
    async fn report_failed(&self, intent: &RouteIntent, error: &RoutesyncError);
}

/// Default reporter: structured log lines only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatusReporter;

#[async_trait]
impl StatusReporter for LogStatusReporter {
    async fn report_applied(&self, intent: &RouteIntent, route: &ResolvedRoute) {
        info!(intent = %intent.name, route = %route, "intent applied");
    }

    async fn report_failed(&self, intent: &RouteIntent, error: &RoutesyncError) {
        warn!(intent = %intent.name, error = %error, "intent failed");
    }
}

/// Drives intents to convergence through the engine.
///
/// Holds the only record of which intents are applied locally; the engine
/// itself tracks destinations, not intent names.
pub struct Reconciler<R> {
    engine: EngineHandle,
    reporter: R,
    node_hostname: String,
    table: TableId,
    requeue_delay: Duration,
    applied: DashMap<String, ResolvedRoute>,
}

impl<R: StatusReporter> Reconciler<R> {
    pub fn new(config: &Config, engine: EngineHandle, reporter: R) -> Self {
        Self {
            engine,
            reporter,
            node_hostname: config.node_hostname.clone(),
            table: config.table,
            requeue_delay: config.requeue_delay,
            applied: DashMap::new(),
        }
    }

    /// Handles one intent event to a terminal outcome.
    pub async fn reconcile(&self, event: IntentEvent) -> ReconcileOutcome {
        match event {
            IntentEvent::Upserted(intent) => self.reconcile_upsert(intent).await,
            IntentEvent::Deleted(name) => self.reconcile_delete(&name).await,
        }
    }

    async fn reconcile_upsert(&self, intent: RouteIntent) -> ReconcileOutcome {
        if intent.node != self.node_hostname {
            // Reassigned elsewhere: drop whatever we installed for it.
            if let Some((name, stale)) = self.applied.remove(&intent.name) {
                info!(intent = %name, node = %intent.node, "intent reassigned, removing local route");
                return self.remove_applied(name, stale).await;
            }
            debug!(intent = %intent.name, node = %intent.node, "intent targets another node");
            return ReconcileOutcome::Done;
        }

        let desired = ResolvedRoute::from_intent(&intent, self.table);
        let prev = self.applied.get(&intent.name).map(|r| r.value().clone());

        for command in plan(prev.as_ref(), &desired) {
            let is_add = matches!(command, RouteCommand::Add(_));
            if let Err(e) = self.submit_and_wait(command).await {
                if is_add {
                    self.applied.remove(&intent.name);
                }
                return self.classify(&intent, e).await;
            }
        }

        self.applied.insert(intent.name.clone(), desired.clone());
        self.reporter.report_applied(&intent, &desired).await;
        ReconcileOutcome::Done
    }

    async fn reconcile_delete(&self, name: &str) -> ReconcileOutcome {
        match self.applied.remove(name) {
            Some((name, route)) => self.remove_applied(name, route).await,
            None => {
                debug!(intent = %name, "delete for intent never applied here");
                ReconcileOutcome::Done
            }
        }
    }

    /// Removes a previously applied route, restoring the bookkeeping entry
    /// when the removal must be retried.
    async fn remove_applied(&self, name: String, route: ResolvedRoute) -> ReconcileOutcome {
        match self.submit_and_wait(RouteCommand::Delete(route.clone())).await {
            Ok(()) => {
                info!(intent = %name, route = %route, "route removed");
                ReconcileOutcome::Done
            }
            Err(e) if e.is_transient() || matches!(e, RoutesyncError::Cancelled) => {
                self.applied.insert(name, route);
                ReconcileOutcome::Requeue(self.requeue_delay)
            }
            Err(e) => {
                warn!(intent = %name, error = %e, "route removal failed");
                ReconcileOutcome::Failed(e)
            }
        }
    }

    async fn classify(&self, intent: &RouteIntent, error: RoutesyncError) -> ReconcileOutcome {
        if error.is_transient() || matches!(error, RoutesyncError::Cancelled) {
            debug!(intent = %intent.name, error = %error, "transient, will requeue");
            return ReconcileOutcome::Requeue(self.requeue_delay);
        }
        self.reporter.report_failed(intent, &error).await;
        ReconcileOutcome::Failed(error)
    }

    async fn submit_and_wait(&self, command: RouteCommand) -> Result<()> {
        self.engine.submit(command)?.outcome().await
    }
}

/// Commands needed to move from the previously applied route to the
/// desired one. Pure diff; all kernel side effects stay in the engine.
///
/// A destination change leaves the old entry behind in the managed table,
/// so it is deleted first. A gateway-only change keeps the destination key
/// and converges through the idempotent replace instead.
fn plan(prev: Option<&ResolvedRoute>, desired: &ResolvedRoute) -> Vec<RouteCommand> {
    let mut commands = Vec::with_capacity(2);
    if let Some(prev) = prev {
        if prev.destination != desired.destination {
            commands.push(RouteCommand::Delete(prev.clone()));
        }
    }
    commands.push(RouteCommand::Add(desired.clone()));
    commands
}
