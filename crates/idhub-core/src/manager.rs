// Process manager: one polling loop per workflow type that claims entities,
// runs their state handler and commits the outcome.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::SharedClock;
use crate::config::ProcessManagerConfig;
use crate::entity::StatefulEntity;
use crate::error::{StoreError, StoreResult};
use crate::events::{EventBus, TransitionEvent};
use crate::handler::{HandlerRegistry, Outcome};
use crate::state::WorkflowState;
use crate::store::EntityStore;

/// Counts of what happened to the entities claimed in one cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub claimed: usize,
    pub advanced: usize,
    pub waited: usize,
    pub retried: usize,
    pub failed: usize,
    /// Entities whose result could not be committed. Their lease expires on
    /// its own.
    pub lost: usize,
    pub storage_errors: usize,
}

impl CycleReport {
    fn record(&mut self, disposition: Disposition) {
        match disposition {
            Disposition::Advanced => self.advanced += 1,
            Disposition::Waited => self.waited += 1,
            Disposition::Retried => self.retried += 1,
            Disposition::Failed => self.failed += 1,
            Disposition::Lost { storage } => {
                self.lost += 1;
                if storage {
                    self.storage_errors += 1;
                }
            }
        }
    }

    /// A full batch where at least one entity reached a new state; there is
    /// likely more work waiting. Retried, waiting and lost entities do not
    /// count, so they are not reclaimed before the next poll interval.
    pub fn saturated(&self, batch_size: usize) -> bool {
        self.claimed >= batch_size.max(1) && self.advanced + self.failed > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Advanced,
    Waited,
    Retried,
    Failed,
    Lost { storage: bool },
}

pub struct ProcessManager<E: StatefulEntity> {
    store: Arc<dyn EntityStore<E>>,
    registry: Arc<HandlerRegistry<E>>,
    events: EventBus,
    clock: SharedClock,
    owner: String,
    config: ProcessManagerConfig,
}

impl<E: StatefulEntity> ProcessManager<E> {
    pub fn new(
        store: Arc<dyn EntityStore<E>>,
        registry: Arc<HandlerRegistry<E>>,
        events: EventBus,
        clock: SharedClock,
        owner: impl Into<String>,
        config: ProcessManagerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            events,
            clock,
            owner: owner.into(),
            config,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn config(&self) -> &ProcessManagerConfig {
        &self.config
    }

    /// Claims one batch and processes it. Storage failures while claiming
    /// abort the cycle; failures while committing are counted in the report.
    pub async fn run_once(&self) -> StoreResult<CycleReport> {
        let states = self.registry.states();
        if states.is_empty() {
            return Ok(CycleReport::default());
        }

        let claimed = self
            .store
            .claim_next(
                self.config.batch_size,
                &states,
                &self.owner,
                self.config.lease_duration(),
            )
            .await?;

        let mut report = CycleReport {
            claimed: claimed.len(),
            ..Default::default()
        };
        if claimed.is_empty() {
            return Ok(report);
        }
        debug!(
            entity_type = E::ENTITY_TYPE,
            owner = %self.owner,
            "claimed {} entities",
            claimed.len()
        );

        let dispositions: Vec<Disposition> = stream::iter(claimed)
            .map(|entity| self.process(entity))
            .buffer_unordered(self.config.max_concurrent_handlers.max(1))
            .collect()
            .await;
        for disposition in dispositions {
            report.record(disposition);
        }
        Ok(report)
    }

    /// Polls until `shutdown` turns true or its sender goes away.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            entity_type = E::ENTITY_TYPE,
            owner = %self.owner,
            "Process manager started (poll interval: {}s, batch size: {})",
            self.config.poll_interval_secs,
            self.config.batch_size
        );

        let mut failures = 0u32;
        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = match self.run_once().await {
                Ok(report) if report.storage_errors == 0 => {
                    failures = 0;
                    // Only sleep when the last batch did not fill up
                    if report.saturated(self.config.batch_size) {
                        continue;
                    }
                    self.config.poll_interval()
                }
                Ok(report) => {
                    failures += 1;
                    let delay = self.config.backoff(failures);
                    error!(
                        entity_type = E::ENTITY_TYPE,
                        "{} commits failed on storage errors, backing off {:?}",
                        report.storage_errors,
                        delay
                    );
                    delay
                }
                Err(err) => {
                    failures += 1;
                    let delay = self.config.backoff(failures);
                    error!(
                        entity_type = E::ENTITY_TYPE,
                        "Error claiming entities: {err}, backing off {:?}",
                        delay
                    );
                    delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(
            entity_type = E::ENTITY_TYPE,
            owner = %self.owner,
            "Process manager stopped"
        );
    }

    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    async fn process(&self, mut entity: E) -> Disposition {
        let claimed = entity.clone();

        let Some(state) = entity.state() else {
            error!(
                entity_type = E::ENTITY_TYPE,
                entity_id = %entity.id(),
                "unknown state code {}",
                entity.meta().state
            );
            return self.release(&claimed).await;
        };
        let Some(handler) = self.registry.handler_for(state).cloned() else {
            warn!(
                entity_type = E::ENTITY_TYPE,
                entity_id = %entity.id(),
                "no handler for state {}",
                state.name()
            );
            return self.release(&claimed).await;
        };

        let outcome = match AssertUnwindSafe(handler.handle(&mut entity))
            .catch_unwind()
            .await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                warn!(
                    entity_type = E::ENTITY_TYPE,
                    entity_id = %entity.id(),
                    state = state.name(),
                    "handler error: {err:#}"
                );
                Outcome::Retry(format!("{err:#}"))
            }
            Err(_) => {
                error!(
                    entity_type = E::ENTITY_TYPE,
                    entity_id = %entity.id(),
                    state = state.name(),
                    "handler panicked"
                );
                Outcome::Retry(format!("handler for {} panicked", state.name()))
            }
        };

        match outcome {
            Outcome::Advance(next) if self.registry.table().allows(state, next) => {
                entity
                    .meta_mut()
                    .transition_to(next.code(), self.clock.now());
                self.commit_transition(&entity, state, next).await
            }
            Outcome::Advance(next) => {
                error!(
                    entity_type = E::ENTITY_TYPE,
                    entity_id = %entity.id(),
                    "illegal transition {} -> {}",
                    state.name(),
                    next.name()
                );
                let reason = format!("illegal transition {} -> {}", state.name(), next.name());
                self.fail(entity, state, reason).await
            }
            Outcome::Wait => match self.commit(&claimed).await {
                Ok(()) => Disposition::Waited,
                Err(lost) => lost,
            },
            Outcome::Retry(reason) => {
                entity.meta_mut().record_retry(reason.clone());
                let attempts = entity.meta().retry_count;
                if attempts > self.config.max_retries {
                    warn!(
                        entity_type = E::ENTITY_TYPE,
                        entity_id = %entity.id(),
                        "giving up after {} retries: {reason}",
                        self.config.max_retries
                    );
                    return self.fail(entity, state, reason).await;
                }
                warn!(
                    entity_type = E::ENTITY_TYPE,
                    entity_id = %entity.id(),
                    state = state.name(),
                    "attempt {attempts} failed, will retry: {reason}"
                );
                match self.commit(&entity).await {
                    Ok(()) => Disposition::Retried,
                    Err(lost) => lost,
                }
            }
            Outcome::Fatal(reason) => self.fail(entity, state, reason).await,
        }
    }

    async fn fail(&self, mut entity: E, previous: E::State, reason: String) -> Disposition {
        let error_state = E::State::error_state();
        error!(
            entity_type = E::ENTITY_TYPE,
            entity_id = %entity.id(),
            "{} -> {}: {reason}",
            previous.name(),
            error_state.name()
        );
        entity
            .meta_mut()
            .fail(error_state.code(), reason, self.clock.now());
        match self.commit_transition(&entity, previous, error_state).await {
            Disposition::Advanced => Disposition::Failed,
            other => other,
        }
    }

    async fn commit_transition(&self, entity: &E, previous: E::State, next: E::State) -> Disposition {
        if let Err(lost) = self.commit(entity).await {
            return lost;
        }
        info!(
            entity_type = E::ENTITY_TYPE,
            entity_id = %entity.id(),
            "{} -> {}",
            previous.name(),
            next.name()
        );
        self.events.publish(&TransitionEvent {
            entity_type: E::ENTITY_TYPE,
            entity_id: entity.id().to_string(),
            previous_state: previous.code(),
            previous_state_name: previous.name(),
            new_state: next.code(),
            new_state_name: next.name(),
            timestamp: entity.meta().state_timestamp,
            trace_context: entity.meta().trace_context.clone(),
        });
        Disposition::Advanced
    }

    async fn commit(&self, entity: &E) -> Result<(), Disposition> {
        self.store
            .commit(entity, &self.owner)
            .await
            .map_err(|err| self.lost(entity, err))
    }

    async fn release(&self, entity: &E) -> Disposition {
        match self.store.release_lease(entity.id(), &self.owner).await {
            Ok(()) => Disposition::Waited,
            Err(err) => self.lost(entity, err),
        }
    }

    fn lost(&self, entity: &E, err: StoreError) -> Disposition {
        match err {
            StoreError::StaleLease { .. } | StoreError::NotFound { .. } => {
                warn!(
                    entity_type = E::ENTITY_TYPE,
                    entity_id = %entity.id(),
                    "result discarded, lease lost: {err}"
                );
                Disposition::Lost { storage: false }
            }
            err => {
                error!(
                    entity_type = E::ENTITY_TYPE,
                    entity_id = %entity.id(),
                    "failed to commit result: {err}"
                );
                Disposition::Lost {
                    storage: matches!(err, StoreError::StorageUnavailable(_)),
                }
            }
        }
    }
}
