// Entity model shared by every workflow type.

use std::collections::BTreeMap;
use std::fmt;

use chrono::serde::ts_milliseconds;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::state::WorkflowState;

/// Time-bounded exclusive claim on an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub owner: String,
    #[serde(with = "ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// An expired lease is treated exactly like no lease.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    pub fn is_held_by(&self, owner: &str, now: DateTime<Utc>) -> bool {
        self.owner == owner && self.is_active_at(now)
    }
}

/// Bookkeeping fields common to all stateful entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityMeta {
    pub id: String,
    pub state: i32,
    #[serde(with = "ts_milliseconds")]
    pub state_timestamp: DateTime<Utc>,
    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,
    #[serde(default)]
    pub trace_context: BTreeMap<String, String>,
}

impl EntityMeta {
    pub fn new(id: impl Into<String>, state: i32, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            state,
            state_timestamp: now,
            created_at: now,
            updated_at: now,
            retry_count: 0,
            error_detail: None,
            lease: None,
            trace_context: BTreeMap::new(),
        }
    }

    pub fn active_lease(&self, now: DateTime<Utc>) -> Option<&Lease> {
        self.lease.as_ref().filter(|lease| lease.is_active_at(now))
    }

    /// Moves to `state` after a successful step.
    pub fn transition_to(&mut self, state: i32, now: DateTime<Utc>) {
        self.state = state;
        self.state_timestamp = now;
        self.retry_count = 0;
        self.error_detail = None;
    }

    /// Records a failed attempt; the entity keeps its state.
    pub fn record_retry(&mut self, reason: impl Into<String>) {
        self.retry_count = self.retry_count.saturating_add(1);
        self.error_detail = Some(reason.into());
    }

    /// Moves to a terminal error state, keeping the failure reason.
    pub fn fail(&mut self, error_state: i32, reason: impl Into<String>, now: DateTime<Utc>) {
        self.state = error_state;
        self.state_timestamp = now;
        self.error_detail = Some(reason.into());
    }
}

/// How a canonical field is stored and compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Integer,
    /// Epoch milliseconds.
    Timestamp,
    /// Workflow state code; filters also accept state names.
    State,
    /// Structured value stored as a JSON document. Not filterable.
    Json,
}

/// Mapping of one canonical field name to its backend representations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDef {
    pub name: &'static str,
    pub column: &'static str,
    /// JSON pointer into the serialized entity.
    pub pointer: &'static str,
    pub kind: FieldKind,
}

impl FieldDef {
    pub const fn new(
        name: &'static str,
        column: &'static str,
        pointer: &'static str,
        kind: FieldKind,
    ) -> Self {
        Self {
            name,
            column,
            pointer,
            kind,
        }
    }
}

pub const ID: FieldDef = FieldDef::new("id", "id", "/meta/id", FieldKind::Text);
pub const STATE: FieldDef = FieldDef::new("state", "state", "/meta/state", FieldKind::State);
pub const STATE_TIMESTAMP: FieldDef = FieldDef::new(
    "stateTimestamp",
    "state_timestamp",
    "/meta/stateTimestamp",
    FieldKind::Timestamp,
);
pub const CREATED_AT: FieldDef =
    FieldDef::new("createdAt", "created_at", "/meta/createdAt", FieldKind::Timestamp);
pub const UPDATED_AT: FieldDef =
    FieldDef::new("updatedAt", "updated_at", "/meta/updatedAt", FieldKind::Timestamp);
pub const RETRY_COUNT: FieldDef =
    FieldDef::new("retryCount", "retry_count", "/meta/retryCount", FieldKind::Integer);
pub const ERROR_DETAIL: FieldDef =
    FieldDef::new("errorDetail", "error_detail", "/meta/errorDetail", FieldKind::Text);
pub const LEASE_OWNER: FieldDef =
    FieldDef::new("leaseOwner", "lease_owner", "/meta/lease/owner", FieldKind::Text);
pub const LEASE_EXPIRES_AT: FieldDef = FieldDef::new(
    "leaseExpiresAt",
    "lease_expires_at",
    "/meta/lease/expiresAt",
    FieldKind::Timestamp,
);
pub const TRACE_CONTEXT: FieldDef = FieldDef::new(
    "traceContext",
    "trace_context",
    "/meta/traceContext",
    FieldKind::Json,
);

/// Columns every entity table carries.
pub const META_FIELDS: &[FieldDef] = &[
    ID,
    STATE,
    STATE_TIMESTAMP,
    CREATED_AT,
    UPDATED_AT,
    RETRY_COUNT,
    ERROR_DETAIL,
    LEASE_OWNER,
    LEASE_EXPIRES_AT,
    TRACE_CONTEXT,
];

/// A record driven through a lifecycle by a process manager.
///
/// Implementors serialize with their [`EntityMeta`] under a `meta` key so
/// that the shared field pointers resolve.
pub trait StatefulEntity:
    Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    type State: WorkflowState;

    /// Name used in events, errors and document directories.
    const ENTITY_TYPE: &'static str;
    /// Relational table name.
    const TABLE: &'static str;
    /// Domain-specific canonical fields, in addition to [`META_FIELDS`].
    const FIELDS: &'static [FieldDef];

    fn meta(&self) -> &EntityMeta;
    fn meta_mut(&mut self) -> &mut EntityMeta;

    fn id(&self) -> &str {
        &self.meta().id
    }

    fn state(&self) -> Option<Self::State> {
        Self::State::from_code(self.meta().state)
    }

    fn field(name: &str) -> Option<&'static FieldDef> {
        META_FIELDS
            .iter()
            .chain(Self::FIELDS.iter())
            .find(|field| field.name == name)
    }

    fn all_fields() -> impl Iterator<Item = &'static FieldDef> {
        META_FIELDS.iter().chain(Self::FIELDS.iter())
    }
}
