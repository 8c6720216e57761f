use clap::{Subcommand, ValueEnum};

pub mod delete;
pub mod init;
pub mod issue;
pub mod lease;
pub mod list;
pub mod request;
pub mod serve;
pub mod show;

pub use delete::Delete;
pub use init::Init;
pub use issue::Issue;
pub use lease::{Lease, Release};
pub use list::List;
pub use request::Request;
pub use serve::Serve;
pub use show::Show;

/// Entity kinds the administrative commands operate on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Kind {
    /// Holder-side credential requests
    #[value(alias = "requests")]
    HolderRequest,
    /// Issuer-side issuance processes
    #[value(alias = "processes")]
    Issuance,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize the storage backend (runs migrations)
    Init(Init),

    /// Run the process managers until interrupted
    Serve(Serve),

    /// Create a holder credential request
    Request(Request),

    /// Create an approved issuance process
    Issue(Issue),

    /// Query entities of one kind
    List(List),

    /// Show one entity as JSON
    Show(Show),

    /// Delete an entity (fails while another owner holds its lease)
    Delete(Delete),

    /// Take an administrative lease on an entity
    Lease(Lease),

    /// Release a lease
    Release(Release),
}

impl Commands {
    /// Log level used when RUST_LOG is not set.
    pub fn default_log_level(&self) -> &'static str {
        match self {
            Commands::Serve(_) => "info",
            _ => "warn",
        }
    }
}
