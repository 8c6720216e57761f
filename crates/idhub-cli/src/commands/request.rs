use anyhow::Result;
use clap::Args;
use uuid::Uuid;

use idhub_core::Clock;
use idhub_core::workflows::{HolderCredentialRequest, RequestedCredential};

use crate::backend::Stores;

const DEFAULT_FORMAT: &str = "VC1_0_JWT";

/// Parses `TYPE[:FORMAT]`.
fn parse_credential(raw: &str) -> Result<RequestedCredential, String> {
    let (credential_type, format) = match raw.split_once(':') {
        Some((credential_type, format)) => (credential_type.trim(), format.trim()),
        None => (raw.trim(), DEFAULT_FORMAT),
    };
    if credential_type.is_empty() || format.is_empty() {
        return Err(format!("expected TYPE[:FORMAT], got `{raw}`"));
    }
    Ok(RequestedCredential {
        id: Uuid::new_v4().to_string(),
        credential_type: credential_type.to_string(),
        format: format.to_string(),
    })
}

#[derive(Args)]
pub struct Request {
    /// Request id (generated when omitted)
    #[arg(long)]
    pub id: Option<String>,

    /// Participant context the request belongs to
    #[arg(long)]
    pub participant: String,

    /// DID of the issuer to ask
    #[arg(long)]
    pub issuer_did: String,

    /// Credential to request, as TYPE[:FORMAT] (repeatable)
    #[arg(long = "credential", required = true, value_parser = parse_credential)]
    pub credentials: Vec<RequestedCredential>,
}

impl Request {
    pub async fn execute(self, stores: &Stores, clock: &dyn Clock) -> Result<()> {
        let id = self.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let request = HolderCredentialRequest::new(
            id,
            self.participant,
            self.issuer_did,
            self.credentials,
            clock.now(),
        )?;
        stores.holder_requests.create(&request).await?;
        println!("✓ Created holder credential request {}", request.meta.id);
        Ok(())
    }
}
