//! Concrete workflows driven by the process engine.

pub mod holder_request;
pub mod issuance;

pub use holder_request::{
    HolderCredentialRequest, HolderRequestState, IssuerClient, IssuerStatus, RequestedCredential,
};
pub use issuance::{CredentialIssuer, IssuanceProcess, IssuanceProcessState};

use crate::error::{EntityError, RemoteError};
use crate::handler::Outcome;

pub(crate) fn require(
    entity_type: &'static str,
    field: &'static str,
    value: &str,
) -> Result<(), EntityError> {
    if value.trim().is_empty() {
        return Err(EntityError::MissingField { entity_type, field });
    }
    Ok(())
}

/// Maps a collaborator failure onto a handler outcome.
pub(crate) fn remote_failure<S>(err: RemoteError) -> Outcome<S> {
    match err {
        RemoteError::Transient(reason) => Outcome::Retry(reason),
        RemoteError::Permanent(reason) => Outcome::Fatal(reason),
    }
}
