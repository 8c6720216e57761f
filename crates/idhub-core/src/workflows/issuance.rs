// Issuer side: delivering approved credentials to the holder.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{remote_failure, require};
use crate::entity::{EntityMeta, FieldDef, FieldKind, StatefulEntity};
use crate::error::{EntityError, RemoteError, StateMachineError};
use crate::handler::{HandlerRegistry, Outcome, StateHandler};
use crate::state::{TransitionTable, WorkflowState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssuanceProcessState {
    Approved,
    Delivered,
    Errored,
}

impl WorkflowState for IssuanceProcessState {
    const WORKFLOW: &'static str = "issuance-process";
    const ALL: &'static [Self] = &[Self::Approved, Self::Delivered, Self::Errored];

    fn code(self) -> i32 {
        match self {
            Self::Approved => 200,
            Self::Delivered => 300,
            Self::Errored => 900,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Approved => "APPROVED",
            Self::Delivered => "DELIVERED",
            Self::Errored => "ERRORED",
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Errored)
    }

    fn error_state() -> Self {
        Self::Errored
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuanceProcess {
    pub meta: EntityMeta,
    pub participant_context_id: String,
    pub holder_id: String,
    /// The holder's own id for the request this process answers.
    pub holder_pid: String,
    pub credential_definitions: Vec<String>,
    #[serde(default)]
    pub claims: Map<String, Value>,
    /// Credential definition id to format.
    #[serde(default)]
    pub credential_formats: BTreeMap<String, String>,
}

impl IssuanceProcess {
    pub fn new(
        id: impl Into<String>,
        participant_context_id: impl Into<String>,
        holder_id: impl Into<String>,
        holder_pid: impl Into<String>,
        credential_definitions: Vec<String>,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Self, EntityError> {
        let id = id.into();
        let participant_context_id = participant_context_id.into();
        let holder_id = holder_id.into();
        let holder_pid = holder_pid.into();
        require(Self::ENTITY_TYPE, "id", &id)?;
        require(Self::ENTITY_TYPE, "participantContextId", &participant_context_id)?;
        require(Self::ENTITY_TYPE, "holderId", &holder_id)?;
        require(Self::ENTITY_TYPE, "holderPid", &holder_pid)?;
        if credential_definitions.is_empty() {
            return Err(EntityError::MissingField {
                entity_type: Self::ENTITY_TYPE,
                field: "credentialDefinitions",
            });
        }

        Ok(Self {
            meta: EntityMeta::new(id, IssuanceProcessState::Approved.code(), now),
            participant_context_id,
            holder_id,
            holder_pid,
            credential_definitions,
            claims: Map::new(),
            credential_formats: BTreeMap::new(),
        })
    }

    pub fn with_claims(mut self, claims: Map<String, Value>) -> Self {
        self.claims = claims;
        self
    }

    pub fn with_format(mut self, definition: impl Into<String>, format: impl Into<String>) -> Self {
        self.credential_formats.insert(definition.into(), format.into());
        self
    }
}

impl StatefulEntity for IssuanceProcess {
    type State = IssuanceProcessState;

    const ENTITY_TYPE: &'static str = "IssuanceProcess";
    const TABLE: &'static str = "issuance_processes";
    const FIELDS: &'static [FieldDef] = &[
        FieldDef::new(
            "participantContextId",
            "participant_context_id",
            "/participantContextId",
            FieldKind::Text,
        ),
        FieldDef::new("holderId", "holder_id", "/holderId", FieldKind::Text),
        FieldDef::new("holderPid", "holder_pid", "/holderPid", FieldKind::Text),
        FieldDef::new(
            "credentialDefinitions",
            "credential_definitions",
            "/credentialDefinitions",
            FieldKind::Json,
        ),
        FieldDef::new("claims", "claims", "/claims", FieldKind::Json),
        FieldDef::new(
            "credentialFormats",
            "credential_formats",
            "/credentialFormats",
            FieldKind::Json,
        ),
    ];

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}

/// Generates, signs and delivers the credentials of one process. Delivery
/// is at-least-once, so implementations must tolerate repeats of the same
/// process id.
#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    async fn issue(&self, process: &IssuanceProcess) -> Result<(), RemoteError>;
}

pub fn transition_table() -> Result<TransitionTable<IssuanceProcessState>, StateMachineError> {
    TransitionTable::new(
        &[IssuanceProcessState::Approved],
        &[(IssuanceProcessState::Approved, &[IssuanceProcessState::Delivered])],
    )
}

pub struct DeliverCredentials {
    issuer: Arc<dyn CredentialIssuer>,
}

impl DeliverCredentials {
    pub fn new(issuer: Arc<dyn CredentialIssuer>) -> Self {
        Self { issuer }
    }
}

#[async_trait]
impl StateHandler<IssuanceProcess> for DeliverCredentials {
    fn produces(&self) -> Vec<IssuanceProcessState> {
        vec![IssuanceProcessState::Delivered]
    }

    async fn handle(
        &self,
        process: &mut IssuanceProcess,
    ) -> anyhow::Result<Outcome<IssuanceProcessState>> {
        match self.issuer.issue(process).await {
            Ok(()) => Ok(Outcome::Advance(IssuanceProcessState::Delivered)),
            Err(err) => Ok(remote_failure(err)),
        }
    }
}

pub fn registry(
    issuer: Arc<dyn CredentialIssuer>,
) -> Result<HandlerRegistry<IssuanceProcess>, StateMachineError> {
    let mut registry = HandlerRegistry::new(transition_table()?);
    registry.register(
        IssuanceProcessState::Approved,
        Arc::new(DeliverCredentials::new(issuer)),
    )?;
    Ok(registry)
}
