//! Storage backends for stateful entities.
//!
//! Every backend implements [`idhub_core::EntityStore`] with the same lease
//! semantics; the relational ones share their SQL through
//! [`translate::sql::Statements`].

#[cfg(any(feature = "sqlite", feature = "postgres"))]
mod delegation;
mod document;
mod memory;
pub mod translate;

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use document::FileEntityStore;
pub use memory::InMemoryEntityStore;

#[cfg(feature = "postgres")]
pub use postgres::{PostgresDatabase, PostgresEntityStore};
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteDatabase, SqliteEntityStore};
