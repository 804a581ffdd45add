//! Parley Shared Types and Utilities
//!
//! This crate contains the data model, wire protocol, validation rules and the
//! persistence collaborator interface shared by the Parley server and clients.

pub mod db;
pub mod error;
pub mod memory;
pub mod protocol;
pub mod store;
pub mod types;
pub mod validation;

pub use db::{create_pool, run_migrations, PgStore};
pub use error::*;
pub use memory::MemoryStore;
pub use protocol::{ClientEvent, ServerEvent};
pub use store::Store;
pub use types::*;
pub use validation::MessageLimits;
