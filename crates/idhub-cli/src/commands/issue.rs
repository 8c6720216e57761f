use anyhow::{Context, Result, bail};
use clap::Args;
use serde_json::{Map, Value};
use uuid::Uuid;

use idhub_core::Clock;
use idhub_core::workflows::IssuanceProcess;

use crate::backend::Stores;

/// Parses `DEFINITION=FORMAT`.
fn parse_format(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((definition, format)) if !definition.is_empty() && !format.is_empty() => {
            Ok((definition.to_string(), format.to_string()))
        }
        _ => Err(format!("expected DEFINITION=FORMAT, got `{raw}`")),
    }
}

#[derive(Args)]
pub struct Issue {
    /// Process id (generated when omitted)
    #[arg(long)]
    pub id: Option<String>,

    /// Issuer participant context
    #[arg(long)]
    pub participant: String,

    /// Holder the credentials are issued to
    #[arg(long)]
    pub holder_id: String,

    /// The holder's id for its credential request
    #[arg(long)]
    pub holder_pid: String,

    /// Credential definition to issue (repeatable)
    #[arg(long = "definition", required = true)]
    pub definitions: Vec<String>,

    /// Claims as a JSON object
    #[arg(long)]
    pub claims: Option<String>,

    /// Format per credential definition, as DEFINITION=FORMAT (repeatable)
    #[arg(long = "format", value_parser = parse_format)]
    pub formats: Vec<(String, String)>,
}

impl Issue {
    pub async fn execute(self, stores: &Stores, clock: &dyn Clock) -> Result<()> {
        let claims = match self.claims.as_deref() {
            None => Map::new(),
            Some(raw) => match serde_json::from_str(raw).context("Failed to parse --claims")? {
                Value::Object(claims) => claims,
                _ => bail!("--claims must be a JSON object"),
            },
        };

        let id = self.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut process = IssuanceProcess::new(
            id,
            self.participant,
            self.holder_id,
            self.holder_pid,
            self.definitions,
            clock.now(),
        )?
        .with_claims(claims);
        for (definition, format) in self.formats {
            process = process.with_format(definition, format);
        }

        stores.issuance.create(&process).await?;
        println!("✓ Created issuance process {}", process.meta.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idhub_core::{EntityError, SystemClock};

    use crate::backend::Backend;

    fn command(claims: Option<&str>) -> Issue {
        Issue {
            id: Some("proc-1".to_string()),
            participant: "issuer-ctx".to_string(),
            holder_id: "did:web:holder".to_string(),
            holder_pid: "req-1".to_string(),
            definitions: vec!["membership-def".to_string()],
            claims: claims.map(str::to_string),
            formats: vec![parse_format("membership-def=VC1_0_JWT").expect("valid")],
        }
    }

    #[tokio::test]
    async fn test_issue_stores_claims_and_formats() -> Result<()> {
        let stores = Backend::connect("memory:").await?.stores(SystemClock::shared())?;
        command(Some(r#"{"level": 3}"#))
            .execute(&stores, &SystemClock)
            .await?;

        let process = stores.issuance.find_by_id("proc-1").await?.expect("created");
        assert_eq!(process.claims.get("level"), Some(&serde_json::json!(3)));
        assert_eq!(
            process.credential_formats.get("membership-def").map(String::as_str),
            Some("VC1_0_JWT")
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_issue_validates_input() -> Result<()> {
        let stores = Backend::connect("memory:").await?.stores(SystemClock::shared())?;
        let err = command(Some("[1, 2]"))
            .execute(&stores, &SystemClock)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("JSON object"));

        let mut missing = command(None);
        missing.definitions.clear();
        let err = missing.execute(&stores, &SystemClock).await.unwrap_err();
        assert!(err.downcast_ref::<EntityError>().is_some());
        assert!(parse_format("no-separator").is_err());
        Ok(())
    }
}
