//! PostgreSQL-backed offset storage

pub mod connection;
pub mod offset_store;

pub use connection::PostgresConfig;
pub use offset_store::PostgresOffsetStore;
