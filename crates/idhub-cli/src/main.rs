mod backend;
mod clients;
mod commands;

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use backend::Backend;
use commands::Commands;
use idhub_core::{EntityError, StoreError, SystemClock};

#[derive(Parser)]
#[command(name = "idhub")]
#[command(about = "idhub - lease-based process engine for credential workflows", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// sqlite:, postgres://, file://<dir> or memory: (DATABASE_URL wins when set)
    #[arg(long, global = true, default_value = "sqlite://.idhub/idhub.db")]
    database_url: String,
}

fn resolve_database_url(default_url: String) -> String {
    std::env::var("DATABASE_URL").unwrap_or(default_url)
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into());
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    // Already installed when called twice in one process
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Commands that write to storage make sure the schema exists first.
fn needs_migrations(command: &Commands) -> bool {
    matches!(
        command,
        Commands::Request(_) | Commands::Issue(_) | Commands::Lease(_)
    )
}

async fn dispatch_command(command: Commands, backend: &Backend) -> Result<()> {
    let clock = SystemClock::shared();
    let stores = || backend.stores(clock.clone());
    if needs_migrations(&command) {
        backend.run_migrations().await?;
    }

    match command {
        Commands::Init(cmd) => cmd.execute(backend).await,
        Commands::Serve(cmd) => cmd.execute(backend, clock.clone()).await,
        Commands::Request(cmd) => cmd.execute(&stores()?, clock.as_ref()).await,
        Commands::Issue(cmd) => cmd.execute(&stores()?, clock.as_ref()).await,
        Commands::List(cmd) => cmd.execute(&stores()?).await,
        Commands::Show(cmd) => cmd.execute(&stores()?).await,
        Commands::Delete(cmd) => cmd.execute(&stores()?).await,
        Commands::Lease(cmd) => cmd.execute(&stores()?).await,
        Commands::Release(cmd) => cmd.execute(&stores()?).await,
    }
}

async fn run_cli(cli: Cli) -> Result<()> {
    let Cli {
        command,
        database_url,
    } = cli;

    let database_url = resolve_database_url(database_url);
    let backend = Backend::connect(&database_url).await?;
    dispatch_command(command, &backend).await
}

/// 2 for errors the caller can fix (bad input, conflicts, missing entities), 1 otherwise.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    let client_error = err.chain().any(|cause| {
        cause
            .downcast_ref::<StoreError>()
            .is_some_and(StoreError::is_client_error)
            || cause.downcast_ref::<EntityError>().is_some()
    });
    if client_error { 2 } else { 1 }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.command.default_log_level());
    match run_cli(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}
