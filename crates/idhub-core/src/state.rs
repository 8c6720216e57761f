// State machine definition: workflow states and the legal transitions between them.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;

use crate::error::StateMachineError;

/// Enumeration of a workflow's lifecycle states.
pub trait WorkflowState: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    /// Workflow name used in diagnostics.
    const WORKFLOW: &'static str;
    const ALL: &'static [Self];

    fn code(self) -> i32;
    fn name(self) -> &'static str;
    fn is_terminal(self) -> bool;
    /// Terminal state entered on fatal failures.
    fn error_state() -> Self;

    fn from_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|state| state.code() == code)
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|state| state.name().eq_ignore_ascii_case(name))
    }
}

/// Declared legal moves of one workflow. The error state is implicitly
/// reachable from every non-terminal state.
#[derive(Debug, Clone)]
pub struct TransitionTable<S: WorkflowState> {
    initial: Vec<S>,
    allowed: HashMap<S, HashSet<S>>,
}

impl<S: WorkflowState> TransitionTable<S> {
    pub fn new(initial: &[S], transitions: &[(S, &[S])]) -> Result<Self, StateMachineError> {
        let error_state = S::error_state();
        if !error_state.is_terminal() {
            return Err(StateMachineError::ErrorStateNotTerminal {
                workflow: S::WORKFLOW,
                state: error_state.name(),
            });
        }
        if initial.is_empty() {
            return Err(StateMachineError::NoInitialState {
                workflow: S::WORKFLOW,
            });
        }
        if let Some(state) = initial.iter().find(|state| state.is_terminal()) {
            return Err(StateMachineError::TerminalInitialState {
                workflow: S::WORKFLOW,
                state: state.name(),
            });
        }

        let mut allowed: HashMap<S, HashSet<S>> = HashMap::new();
        for (from, targets) in transitions {
            if from.is_terminal() && !targets.is_empty() {
                return Err(StateMachineError::TerminalHasTransitions {
                    workflow: S::WORKFLOW,
                    state: from.name(),
                });
            }
            allowed
                .entry(*from)
                .or_default()
                .extend(targets.iter().copied());
        }

        Ok(Self {
            initial: initial.to_vec(),
            allowed,
        })
    }

    pub fn initial_states(&self) -> &[S] {
        &self.initial
    }

    pub fn is_initial(&self, state: S) -> bool {
        self.initial.contains(&state)
    }

    pub fn allows(&self, from: S, to: S) -> bool {
        if from.is_terminal() {
            return false;
        }
        if to == S::error_state() {
            return true;
        }
        self.allowed
            .get(&from)
            .is_some_and(|targets| targets.contains(&to))
    }

    /// Explicitly declared targets of `from`, in code order.
    pub fn targets(&self, from: S) -> Vec<S> {
        let mut targets: Vec<S> = self
            .allowed
            .get(&from)
            .map(|targets| targets.iter().copied().collect())
            .unwrap_or_default();
        targets.sort_by_key(|state| state.code());
        targets
    }
}
