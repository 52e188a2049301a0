//! SurrealDB repository implementations.

mod link;
mod permission;
mod resource;
mod user;

use surrealdb_types::SurrealValue;

pub use link::SurrealLinkRepository;
pub use permission::SurrealPermissionRepository;
pub use resource::SurrealResourceRepository;
pub use user::SurrealUserRepository;

pub(crate) use permission::{PermissionRow, permission_record_key};
pub(crate) use resource::ResourceRow;
pub(crate) use user::UserRow;

#[derive(Debug, SurrealValue)]
pub(crate) struct CountRow {
    pub total: u64,
}

/// Prefix matching the descendants of `link` but not its siblings.
pub(crate) fn descendant_prefix(link: Option<&str>) -> String {
    link.map(|l| format!("{l}/")).unwrap_or_default()
}
