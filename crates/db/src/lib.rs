//! `db` crate: pure persistence layer.
//!
//! Provides the [`Store`] contract the engine persists through, typed
//! records, an in-memory store and a Postgres store with its repository
//! functions. No business logic lives here.

pub mod error;
pub mod memory;
pub mod models;
pub mod pool;
pub mod postgres;
pub mod repository;
pub mod store;

pub use error::DbError;
pub use memory::MemoryStore;
pub use pool::DbPool;
pub use postgres::PgStore;
pub use store::Store;
