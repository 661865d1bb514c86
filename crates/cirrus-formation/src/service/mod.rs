//! Service lifecycle management.
//!
//! Wires the store, scheduler, adapters and orchestrator together and runs
//! the dispatch loop with signal handling and graceful shutdown.

use std::sync::Arc;

use tokio::signal;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapter::{create_adapter_factory, AdapterFactory};
use crate::config::FormationConfig;
use crate::error::{FormationError, FormationResult};
use crate::lifecycle::ExperimentLifecycle;
use crate::orchestrator::{Orchestrator, OrchestratorSettings};
use crate::scheduler::{JobReceiver, TokioScheduler};
use crate::store::{FormationStore, MemoryStore, PostgresStore};

/// The formation service.
///
/// Owns:
/// - the experiment store
/// - the in-process deferred scheduler
/// - the orchestrator and the lifecycle bridge it reports to
pub struct FormationService {
    config: FormationConfig,
    store: Arc<dyn FormationStore>,
    scheduler: Arc<TokioScheduler>,
    receiver: Mutex<Option<JobReceiver>>,
    lifecycle: Arc<ExperimentLifecycle>,
    orchestrator: Arc<Orchestrator>,
    cancel: CancellationToken,
}

impl FormationService {
    /// Build the service from configuration.
    ///
    /// Falls back to the in-memory store when PostgreSQL is unreachable.
    pub async fn from_config(config: FormationConfig) -> Self {
        let store = create_store(&config).await;
        let adapters = create_adapter_factory(&config.backend);
        info!(
            adapter_type = ?config.backend.adapter_type,
            "backend adapters configured"
        );
        Self::new(config, store, adapters)
    }

    /// Build the service around an existing store and adapter factory.
    #[must_use]
    pub fn new(
        config: FormationConfig,
        store: Arc<dyn FormationStore>,
        adapters: Arc<dyn AdapterFactory>,
    ) -> Self {
        let (scheduler, receiver) = TokioScheduler::new();
        let scheduler = Arc::new(scheduler);
        let settings = OrchestratorSettings::from_config(&config);

        let lifecycle = Arc::new(ExperimentLifecycle::new(
            Arc::clone(&store),
            scheduler.clone(),
            settings.queue.clone(),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            scheduler.clone(),
            adapters,
            Arc::clone(&store),
            lifecycle.clone(),
            settings,
        ));

        Self {
            config,
            store,
            scheduler,
            receiver: Mutex::new(Some(receiver)),
            lifecycle,
            orchestrator,
            cancel: CancellationToken::new(),
        }
    }

    /// Entry point for starting and stopping experiments.
    #[must_use]
    pub fn lifecycle(&self) -> Arc<ExperimentLifecycle> {
        Arc::clone(&self.lifecycle)
    }

    /// The orchestrator driving scheduled steps.
    #[must_use]
    pub fn orchestrator(&self) -> Arc<Orchestrator> {
        Arc::clone(&self.orchestrator)
    }

    /// The experiment store.
    #[must_use]
    pub fn store(&self) -> Arc<dyn FormationStore> {
        Arc::clone(&self.store)
    }

    /// Run the dispatch loop until a shutdown signal arrives.
    ///
    /// Due jobs are handed to the orchestrator, at most
    /// `scheduler.dispatch_concurrency` at a time. Steps already running
    /// are allowed to finish; pending timers are dropped.
    pub async fn run(&self) -> FormationResult<()> {
        let mut receiver = self
            .receiver
            .lock()
            .await
            .take()
            .ok_or_else(|| FormationError::internal("dispatch loop already running"))?;

        let concurrency = self.config.scheduler.dispatch_concurrency.max(1);
        let permits = Arc::new(Semaphore::new(concurrency));
        let mut in_flight = JoinSet::new();

        let settings = self.orchestrator.settings();
        info!(
            queue = %settings.queue,
            concurrency,
            poll_interval = ?settings.poll_interval,
            max_poll_attempts = ?settings.max_poll_attempts,
            failure_policy = ?settings.failure_policy,
            "formation service running"
        );

        let shutdown = shutdown_signal(self.cancel.clone());
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => break,
                job = receiver.recv() => {
                    let Some(job) = job else {
                        warn!("scheduler channel closed");
                        break;
                    };
                    let permit = Arc::clone(&permits)
                        .acquire_owned()
                        .await
                        .map_err(|_| FormationError::internal("dispatch semaphore closed"))?;

                    debug!(job_id = %job.id, step = %job.step, "dispatching");
                    let orchestrator = Arc::clone(&self.orchestrator);
                    in_flight.spawn(async move {
                        orchestrator.advance(job).await;
                        drop(permit);
                    });
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "step task panicked");
                    }
                }
            }
        }

        let pending = self.scheduler.pending_count();
        self.scheduler.cancel_all();
        info!(
            pending,
            in_flight = in_flight.len(),
            "draining formation service"
        );

        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "step task panicked");
            }
        }

        *self.receiver.lock().await = Some(receiver);
        info!("formation service shutdown complete");
        Ok(())
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for FormationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormationService")
            .field("config", &self.config)
            .field("orchestrator", &self.orchestrator)
            .finish_non_exhaustive()
    }
}

async fn create_store(config: &FormationConfig) -> Arc<dyn FormationStore> {
    match PostgresStore::connect(&config.database).await {
        Ok(store) => {
            info!(url = %config.database.url, "connected to PostgreSQL");
            Arc::new(store)
        }
        Err(e) => {
            error!(
                error = %e,
                "failed to connect to PostgreSQL, using in-memory store"
            );
            Arc::new(MemoryStore::new())
        }
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            info!("received SIGTERM, initiating shutdown");
        }
        () = cancel.cancelled() => {
            info!("shutdown requested");
        }
    }
}
