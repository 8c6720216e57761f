use anyhow::Result;
use clap::Args;
use tracing::info;

use crate::backend::Backend;

#[derive(Args)]
pub struct Init;

impl Init {
    pub async fn execute(self, backend: &Backend) -> Result<()> {
        info!("Running migrations...");
        backend.run_migrations().await?;
        println!("✓ Storage initialized ({})", backend.name());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init_creates_document_root() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().join("documents");
        let backend = Backend::connect(&format!("file://{}", root.display())).await?;

        Init.execute(&backend).await?;
        assert!(root.is_dir());
        Ok(())
    }
}
