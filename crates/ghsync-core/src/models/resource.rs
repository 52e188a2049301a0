//! Resource domain model.
//!
//! Resources form a forest: organizations are roots, repositories hang
//! below the organization that owns them. A repository is never the
//! parent of another resource.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Organization,
    Repository,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Organization => "organization",
            Self::Repository => "repository",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "organization" => Ok(Self::Organization),
            "repository" => Ok(Self::Repository),
            other => Err(SyncError::validation(format!(
                "unknown resource kind `{other}`"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Stable external id assigned by the upstream platform.
    pub id: i64,
    /// Last path segment (`widgets` for `acme/widgets`).
    pub path: String,
    /// Canonical lower-case link (`acme` or `acme/widgets`).
    pub link: String,
    pub kind: ResourceKind,
    pub parent_id: Option<i64>,
    /// Materialized path of external ids from the root, dot-separated.
    pub lpath: Option<String>,
}

impl Resource {
    /// A root resource (no parent) of the given kind.
    pub fn root(id: i64, link: &str, kind: ResourceKind) -> Self {
        let link = normalize_link(link);
        let path = link.rsplit('/').next().unwrap_or_default().to_string();
        Self {
            id,
            path,
            link,
            kind,
            parent_id: None,
            lpath: Some(id.to_string()),
        }
    }

    /// A repository nested under this organization.
    pub fn child_repository(&self, id: i64, path: &str) -> Self {
        let lpath = match &self.lpath {
            Some(parent) => format!("{parent}.{id}"),
            None => format!("{}.{id}", self.id),
        };
        Self {
            id,
            path: path.to_lowercase(),
            link: normalize_link(&format!("{}/{}", self.link, path)),
            kind: ResourceKind::Repository,
            parent_id: Some(self.id),
            lpath: Some(lpath),
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Depth in the forest, roots being `0`.
    pub fn depth(&self) -> usize {
        link_depth(&self.link)
    }
}

/// Canonical form of a user-supplied link: trimmed, without surrounding
/// slashes, lower-case.
pub fn normalize_link(link: &str) -> String {
    link.trim().trim_matches('/').to_lowercase()
}

/// Number of `/` separators in a link; `0` for top-level links.
pub fn link_depth(link: &str) -> usize {
    link.matches('/').count()
}
