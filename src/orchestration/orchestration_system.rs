//! # Orchestration System
//!
//! Wires an [`Orchestrator`] to its queue: creates the configured queues,
//! recovers unfinished runs, and runs the background loops.
//!
//! - outcome loop: drains the result channel into `signal_task_outcome`,
//!   acknowledging an outcome only once it has been handled
//! - deadline ticker: turns expired attempts into timeouts
//! - worker pools: one per queue with a registered handler
//!
//! All loops stop when the [`SystemHandle`] is shut down.

use super::clock::SharedClock;
use super::engine::Orchestrator;
use crate::client::PipelineClient;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::messaging::{Delivery, OutcomeMessage, SharedQueue};
use crate::store::SharedStore;
use crate::worker::{HandlerRegistry, WorkerPool};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct OrchestrationSystem {
    orchestrator: Arc<Orchestrator>,
    queue: SharedQueue,
    registry: HandlerRegistry,
    config: PipelineConfig,
}

impl std::fmt::Debug for OrchestrationSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestrationSystem")
            .field("orchestrator", &self.orchestrator)
            .field("registry", &self.registry)
            .finish()
    }
}

impl OrchestrationSystem {
    pub fn new(
        config: PipelineConfig,
        store: SharedStore,
        queue: SharedQueue,
        clock: SharedClock,
        registry: HandlerRegistry,
    ) -> Self {
        let orchestrator = Arc::new(Orchestrator::new(&config, store, Arc::clone(&queue), clock));
        Self {
            orchestrator,
            queue,
            registry,
            config,
        }
    }

    /// Use an already built orchestrator, e.g. one with a fixed owner id
    pub fn with_orchestrator(
        config: PipelineConfig,
        orchestrator: Arc<Orchestrator>,
        queue: SharedQueue,
        registry: HandlerRegistry,
    ) -> Self {
        Self {
            orchestrator,
            queue,
            registry,
            config,
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Create queues, recover unfinished runs, then start every loop
    pub async fn start(self) -> Result<SystemHandle> {
        info!(owner_id = %self.orchestrator.owner_id(), "🚀 Starting orchestration system");

        for queue_name in self.config.queue_names() {
            self.queue.ensure_queue(&queue_name).await?;
        }

        let recovered = self.orchestrator.recover_all().await?;
        if !recovered.is_empty() {
            info!(runs = recovered.len(), "🔄 Resumed unfinished runs");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(outcome_loop(
            Arc::clone(&self.orchestrator),
            Arc::clone(&self.queue),
            self.config.queue.poll_interval() * 10,
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(deadline_loop(
            Arc::clone(&self.orchestrator),
            self.config.engine.deadline_tick(),
            shutdown_rx.clone(),
        )));

        for (_, stage_config) in self.config.stages.iter() {
            let queue_name = &stage_config.queue_name;
            let Some(handler) = self.registry.get(queue_name) else {
                warn!(queue = %queue_name, "No handler registered; queue has no local workers");
                continue;
            };
            let pool = Arc::new(WorkerPool::new(
                queue_name.clone(),
                handler,
                Arc::clone(&self.queue),
                self.config.workers.concurrency_for(queue_name),
            ));
            tasks.extend(pool.spawn(shutdown_rx.clone()));
        }

        info!(background_tasks = tasks.len(), "✅ Orchestration system started");
        Ok(SystemHandle {
            orchestrator: self.orchestrator,
            shutdown: shutdown_tx,
            tasks,
        })
    }
}

/// Running system; dropping it without `shutdown` leaves the loops running
#[derive(Debug)]
pub struct SystemHandle {
    orchestrator: Arc<Orchestrator>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SystemHandle {
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn client(&self) -> PipelineClient {
        PipelineClient::new(Arc::clone(&self.orchestrator))
    }

    /// Signal every loop to stop and wait for them
    pub async fn shutdown(self) {
        info!("🛑 Shutting down orchestration system");
        let _ = self.shutdown.send(true);
        for result in join_all(self.tasks).await {
            if let Err(e) = result {
                error!(error = %e, "Background task ended abnormally");
            }
        }
    }
}

async fn outcome_loop(
    orchestrator: Arc<Orchestrator>,
    queue: SharedQueue,
    wait: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    while !*shutdown.borrow() {
        let next = tokio::select! {
            _ = shutdown.changed() => break,
            next = queue.next_outcome(wait) => next,
        };
        match next {
            Ok(Some(delivery)) => handle_outcome(&orchestrator, &queue, delivery).await,
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Reading the result channel failed");
                tokio::time::sleep(queue.poll_interval()).await;
            }
        }
    }
    debug!("Outcome loop stopped");
}

async fn handle_outcome(
    orchestrator: &Orchestrator,
    queue: &SharedQueue,
    delivery: Delivery<OutcomeMessage>,
) {
    let message = &delivery.message;
    let handled = orchestrator
        .signal_task_outcome(&message.run_id, message.task_id, message.outcome.clone())
        .await;

    let ack = match handled {
        Ok(_) => true,
        Err(PipelineError::RunNotFound(run_id)) => {
            warn!(run_id = %run_id, "Dropping outcome for unknown run");
            true
        }
        Err(e) if e.is_lease_conflict() => {
            debug!(run_id = %message.run_id, error = %e, "Outcome left for the lease holder");
            false
        }
        Err(e) => {
            error!(
                run_id = %message.run_id,
                task_id = %message.task_id,
                error = %e,
                "Outcome not recorded; it will be redelivered"
            );
            false
        }
    };

    if ack {
        if let Err(e) = queue.ack(&delivery.receipt).await {
            warn!(error = %e, "Could not acknowledge outcome; it may be redelivered");
        }
    }
}

async fn deadline_loop(
    orchestrator: Arc<Orchestrator>,
    tick: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    while !*shutdown.borrow() {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                let timed_out = orchestrator.handle_timeouts().await;
                if timed_out > 0 {
                    info!(timed_out, "⏰ Recorded attempt timeouts");
                }
            }
        }
    }
    debug!("Deadline loop stopped");
}
