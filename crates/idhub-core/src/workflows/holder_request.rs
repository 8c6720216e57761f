// Holder side: asking an issuer for credentials and following the request
// until the issuer reports an outcome.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use super::{remote_failure, require};
use crate::clock::SharedClock;
use crate::entity::{EntityMeta, FieldDef, FieldKind, StatefulEntity};
use crate::error::{EntityError, RemoteError, StateMachineError};
use crate::handler::{HandlerRegistry, Outcome, StateHandler};
use crate::state::{TransitionTable, WorkflowState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HolderRequestState {
    Created,
    Submitted,
    Requested,
    Issued,
    Error,
}

impl WorkflowState for HolderRequestState {
    const WORKFLOW: &'static str = "holder-credential-request";
    const ALL: &'static [Self] = &[
        Self::Created,
        Self::Submitted,
        Self::Requested,
        Self::Issued,
        Self::Error,
    ];

    fn code(self) -> i32 {
        match self {
            Self::Created => 100,
            Self::Submitted => 200,
            Self::Requested => 300,
            Self::Issued => 400,
            Self::Error => 900,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Submitted => "SUBMITTED",
            Self::Requested => "REQUESTED",
            Self::Issued => "ISSUED",
            Self::Error => "ERROR",
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, Self::Issued | Self::Error)
    }

    fn error_state() -> Self {
        Self::Error
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedCredential {
    pub id: String,
    #[serde(rename = "type")]
    pub credential_type: String,
    pub format: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HolderCredentialRequest {
    pub meta: EntityMeta,
    pub participant_context_id: String,
    pub issuer_did: String,
    pub requested_credentials: Vec<RequestedCredential>,
    /// Process id the issuer assigned once the request was accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer_pid: Option<String>,
}

impl HolderCredentialRequest {
    pub fn new(
        id: impl Into<String>,
        participant_context_id: impl Into<String>,
        issuer_did: impl Into<String>,
        requested_credentials: Vec<RequestedCredential>,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Self, EntityError> {
        let id = id.into();
        let participant_context_id = participant_context_id.into();
        let issuer_did = issuer_did.into();
        require(Self::ENTITY_TYPE, "id", &id)?;
        require(Self::ENTITY_TYPE, "participantContextId", &participant_context_id)?;
        require(Self::ENTITY_TYPE, "issuerDid", &issuer_did)?;
        if requested_credentials.is_empty() {
            return Err(EntityError::MissingField {
                entity_type: Self::ENTITY_TYPE,
                field: "requestedCredentials",
            });
        }

        Ok(Self {
            meta: EntityMeta::new(id, HolderRequestState::Created.code(), now),
            participant_context_id,
            issuer_did,
            requested_credentials,
            issuer_pid: None,
        })
    }
}

impl StatefulEntity for HolderCredentialRequest {
    type State = HolderRequestState;

    const ENTITY_TYPE: &'static str = "HolderCredentialRequest";
    const TABLE: &'static str = "holder_credential_requests";
    const FIELDS: &'static [FieldDef] = &[
        FieldDef::new(
            "participantContextId",
            "participant_context_id",
            "/participantContextId",
            FieldKind::Text,
        ),
        FieldDef::new("issuerDid", "issuer_did", "/issuerDid", FieldKind::Text),
        FieldDef::new("issuerPid", "issuer_pid", "/issuerPid", FieldKind::Text),
        FieldDef::new(
            "requestedCredentials",
            "requested_credentials",
            "/requestedCredentials",
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

/// Issuer-reported status of a credential request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssuerStatus {
    Received,
    Issued,
    Rejected(Option<String>),
}

/// Narrow view of the issuer service the holder talks to.
#[async_trait]
pub trait IssuerClient: Send + Sync {
    /// Sends the request and returns the issuer's process id. Must be safe to
    /// repeat for the same request id.
    async fn request_credentials(
        &self,
        request: &HolderCredentialRequest,
    ) -> Result<String, RemoteError>;

    async fn request_status(
        &self,
        request: &HolderCredentialRequest,
    ) -> Result<IssuerStatus, RemoteError>;
}

pub fn transition_table() -> Result<TransitionTable<HolderRequestState>, StateMachineError> {
    use HolderRequestState::*;
    TransitionTable::new(
        &[Created],
        &[
            (Created, &[Submitted]),
            (Submitted, &[Requested]),
            (Requested, &[Issued]),
        ],
    )
}

/// Accepts a freshly created request for sending.
#[derive(Debug, Default)]
pub struct SubmitRequest;

#[async_trait]
impl StateHandler<HolderCredentialRequest> for SubmitRequest {
    fn produces(&self) -> Vec<HolderRequestState> {
        vec![HolderRequestState::Submitted]
    }

    async fn handle(
        &self,
        _request: &mut HolderCredentialRequest,
    ) -> anyhow::Result<Outcome<HolderRequestState>> {
        Ok(Outcome::Advance(HolderRequestState::Submitted))
    }
}

pub struct SendCredentialRequest {
    issuer: Arc<dyn IssuerClient>,
}

impl SendCredentialRequest {
    pub fn new(issuer: Arc<dyn IssuerClient>) -> Self {
        Self { issuer }
    }
}

#[async_trait]
impl StateHandler<HolderCredentialRequest> for SendCredentialRequest {
    fn produces(&self) -> Vec<HolderRequestState> {
        vec![HolderRequestState::Requested]
    }

    async fn handle(
        &self,
        request: &mut HolderCredentialRequest,
    ) -> anyhow::Result<Outcome<HolderRequestState>> {
        match self.issuer.request_credentials(request).await {
            Ok(issuer_pid) => {
                request.issuer_pid = Some(issuer_pid);
                Ok(Outcome::Advance(HolderRequestState::Requested))
            }
            Err(err) => Ok(remote_failure(err)),
        }
    }
}

/// Polls the issuer until the credentials are issued, the request is
/// rejected, or the request sat in `REQUESTED` longer than `time_limit`.
pub struct CheckIssuanceStatus {
    issuer: Arc<dyn IssuerClient>,
    clock: SharedClock,
    time_limit: Duration,
}

impl CheckIssuanceStatus {
    pub fn new(issuer: Arc<dyn IssuerClient>, clock: SharedClock, time_limit: Duration) -> Self {
        Self {
            issuer,
            clock,
            time_limit,
        }
    }

    fn timed_out(&self, request: &HolderCredentialRequest) -> bool {
        let limit = TimeDelta::from_std(self.time_limit).unwrap_or(TimeDelta::MAX);
        self.clock.now() - request.meta.state_timestamp > limit
    }
}

#[async_trait]
impl StateHandler<HolderCredentialRequest> for CheckIssuanceStatus {
    fn produces(&self) -> Vec<HolderRequestState> {
        vec![HolderRequestState::Issued]
    }

    async fn handle(
        &self,
        request: &mut HolderCredentialRequest,
    ) -> anyhow::Result<Outcome<HolderRequestState>> {
        if self.timed_out(request) {
            return Ok(Outcome::Fatal(format!(
                "issuer did not issue credentials within {}s",
                self.time_limit.as_secs()
            )));
        }
        if request.issuer_pid.is_none() {
            return Ok(Outcome::Fatal("no issuer process id recorded".to_string()));
        }

        match self.issuer.request_status(request).await {
            Ok(IssuerStatus::Issued) => Ok(Outcome::Advance(HolderRequestState::Issued)),
            Ok(IssuerStatus::Received) => Ok(Outcome::Wait),
            Ok(IssuerStatus::Rejected(reason)) => Ok(Outcome::Fatal(format!(
                "issuer rejected the request: {}",
                reason.as_deref().unwrap_or("no reason given")
            ))),
            Err(err) => Ok(remote_failure(err)),
        }
    }
}

/// Registry with the default handler for every non-terminal state.
pub fn registry(
    issuer: Arc<dyn IssuerClient>,
    clock: SharedClock,
    requested_time_limit: Duration,
) -> Result<HandlerRegistry<HolderCredentialRequest>, StateMachineError> {
    let mut registry = HandlerRegistry::new(transition_table()?);
    registry.register(HolderRequestState::Created, Arc::new(SubmitRequest))?;
    registry.register(
        HolderRequestState::Submitted,
        Arc::new(SendCredentialRequest::new(issuer.clone())),
    )?;
    registry.register(
        HolderRequestState::Requested,
        Arc::new(CheckIssuanceStatus::new(issuer, clock, requested_time_limit)),
    )?;
    Ok(registry)
}

#[cfg(test)]
mod tests;
