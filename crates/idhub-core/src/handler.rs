// State handlers and the per-workflow registry that binds them to states.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::entity::StatefulEntity;
use crate::error::StateMachineError;
use crate::state::{TransitionTable, WorkflowState};

/// Classification a handler returns for one processing attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<S> {
    /// Commit the handler's changes and move to the given state.
    Advance(S),
    /// Nothing to do yet; drop the changes and release the lease.
    Wait,
    /// Retryable failure.
    Retry(String),
    /// Unrecoverable failure; the entity moves to its error state.
    Fatal(String),
}

/// Business logic for one state of one workflow.
#[async_trait]
pub trait StateHandler<E: StatefulEntity>: Send + Sync {
    /// States `handle` may return through [`Outcome::Advance`].
    fn produces(&self) -> Vec<E::State>;

    /// Called with a leased copy of the entity. Changes made to it are
    /// persisted on `Advance`, `Retry` and `Fatal`.
    async fn handle(&self, entity: &mut E) -> anyhow::Result<Outcome<E::State>>;
}

pub type SharedHandler<E> = Arc<dyn StateHandler<E>>;

pub struct HandlerRegistry<E: StatefulEntity> {
    table: TransitionTable<E::State>,
    handlers: HashMap<E::State, SharedHandler<E>>,
}

impl<E: StatefulEntity> HandlerRegistry<E> {
    pub fn new(table: TransitionTable<E::State>) -> Self {
        Self {
            table,
            handlers: HashMap::new(),
        }
    }

    /// Binds `handler` to `state`, returning the handler it replaces.
    pub fn register(
        &mut self,
        state: E::State,
        handler: SharedHandler<E>,
    ) -> Result<Option<SharedHandler<E>>, StateMachineError> {
        if state.is_terminal() {
            return Err(StateMachineError::HandlerForTerminalState {
                workflow: <E::State as WorkflowState>::WORKFLOW,
                state: state.name(),
            });
        }
        if let Some(target) = handler
            .produces()
            .into_iter()
            .find(|target| !self.table.allows(state, *target))
        {
            return Err(StateMachineError::DisallowedTarget {
                workflow: <E::State as WorkflowState>::WORKFLOW,
                from: state.name(),
                to: target.name(),
            });
        }
        Ok(self.handlers.insert(state, handler))
    }

    pub fn handler_for(&self, state: E::State) -> Option<&SharedHandler<E>> {
        self.handlers.get(&state)
    }

    /// States with a registered handler, in code order.
    pub fn states(&self) -> Vec<E::State> {
        let mut states: Vec<E::State> = self.handlers.keys().copied().collect();
        states.sort_by_key(|state| state.code());
        states
    }

    pub fn table(&self) -> &TransitionTable<E::State> {
        &self.table
    }
}

impl<E: StatefulEntity> std::fmt::Debug for HandlerRegistry<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("workflow", &<E::State as WorkflowState>::WORKFLOW)
            .field("states", &self.states())
            .finish()
    }
}
