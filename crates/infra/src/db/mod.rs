//! Database adapters: the shared in-memory tables and the PostgreSQL pool/schema.

pub mod memory;
pub mod postgres;

pub use memory::InMemoryDatabase;
