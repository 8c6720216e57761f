//! Backend-specific query translation.

pub mod memory;
pub mod sql;

pub use memory::CompiledQuery;
pub use sql::{Dialect, SqlParam, SqlStatement};
