//! ghsync database: SurrealDB connection management, schema migrations
//! and the transactional store behind the `ghsync-core` repository traits.

mod connection;
mod error;
pub mod repository;
mod schema;
mod store;

pub use connection::{DbConfig, DbManager};
pub use error::DbError;
pub use schema::{run_migrations, schema_v1};
pub use store::SurrealStore;
