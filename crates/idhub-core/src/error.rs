use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity_type} {id} already exists")]
    Duplicate { entity_type: &'static str, id: String },

    #[error("{entity_type} {id} not found")]
    NotFound { entity_type: &'static str, id: String },

    #[error("{entity_type} {id} is leased by {}", holder.as_deref().unwrap_or("another owner"))]
    StaleLease {
        entity_type: &'static str,
        id: String,
        holder: Option<String>,
    },

    #[error("unsupported query: {0}")]
    UnsupportedQuery(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[source] anyhow::Error),
}

impl StoreError {
    pub fn duplicate(entity_type: &'static str, id: impl Into<String>) -> Self {
        Self::Duplicate {
            entity_type,
            id: id.into(),
        }
    }

    pub fn not_found(entity_type: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type,
            id: id.into(),
        }
    }

    pub fn stale_lease(
        entity_type: &'static str,
        id: impl Into<String>,
        holder: Option<String>,
    ) -> Self {
        Self::StaleLease {
            entity_type,
            id: id.into(),
            holder,
        }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::UnsupportedQuery(message.into())
    }

    pub fn unavailable(err: impl Into<anyhow::Error>) -> Self {
        Self::StorageUnavailable(err.into())
    }

    /// Expected outcomes a caller can act on, as opposed to backend faults.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Self::StorageUnavailable(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateMachineError {
    #[error("workflow {workflow} declares no initial state")]
    NoInitialState { workflow: &'static str },
    #[error("initial state {state} of {workflow} is terminal")]
    TerminalInitialState {
        workflow: &'static str,
        state: &'static str,
    },
    #[error("error state {state} of {workflow} must be terminal")]
    ErrorStateNotTerminal {
        workflow: &'static str,
        state: &'static str,
    },
    #[error("terminal state {state} of {workflow} declares outgoing transitions")]
    TerminalHasTransitions {
        workflow: &'static str,
        state: &'static str,
    },
    #[error("cannot register a handler for terminal state {state} of {workflow}")]
    HandlerForTerminalState {
        workflow: &'static str,
        state: &'static str,
    },
    #[error("handler for {from} of {workflow} may produce {to}, which is not an allowed transition")]
    DisallowedTarget {
        workflow: &'static str,
        from: &'static str,
        to: &'static str,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EntityError {
    #[error("{entity_type} requires a non-empty `{field}`")]
    MissingField {
        entity_type: &'static str,
        field: &'static str,
    },
    #[error("{entity_type} in unknown state {code}")]
    UnknownState { entity_type: &'static str, code: i32 },
}

/// Failure reported by an external collaborator a handler talks to.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("transient remote failure: {0}")]
    Transient(String),
    #[error("permanent remote failure: {0}")]
    Permanent(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("yaml parse error in {path}: {source}")]
    YamlParse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("invalid {field}: {value} (expected seconds between 0 and {max})")]
    InvalidSeconds {
        field: &'static str,
        value: f64,
        max: f64,
    },
}
