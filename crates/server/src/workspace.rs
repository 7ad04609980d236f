//! Workspace identity and handshake resolution.
//!
//! A gateway process runs in exactly one [`ResolutionMode`]. Query mode reads
//! `workspace` + `owner` from the upgrade URL (shared multi-tenant runner);
//! host mode takes the workspace from the leading label of the `Host` header
//! (one runner per workspace, routed by subdomain).

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

use crate::auth::Principal;

const MAX_ID_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionMode {
    Query,
    Host,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no workspace identifier in handshake")]
    MissingWorkspace,
    #[error("no owner in handshake")]
    MissingOwner,
    #[error("invalid identifier {0:?}")]
    InvalidIdentifier(String),
    #[error("owner {owner:?} does not match authenticated principal {principal:?}")]
    OwnerMismatch { owner: String, principal: String },
}

/// Owner + project slug. Immutable once bound to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkspaceId {
    owner: String,
    name: String,
}

impl WorkspaceId {
    pub fn new(owner: &str, name: &str) -> Result<Self, ResolveError> {
        Ok(Self {
            owner: validate_identifier(owner)?,
            name: validate_identifier(name)?,
        })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `<storage_class>/<owner>/<name>`
    pub fn remote_prefix(&self, storage_class: &str) -> String {
        format!("{}/{}/{}", storage_class, self.owner, self.name)
    }
}

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

pub fn validate_identifier(value: &str) -> Result<String, ResolveError> {
    let valid = !value.is_empty()
        && value.len() <= MAX_ID_LEN
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(value.to_string())
    } else {
        Err(ResolveError::InvalidIdentifier(value.to_string()))
    }
}

/// Resolve the workspace a connection is bound to.
pub fn resolve_workspace(
    mode: ResolutionMode,
    principal: &Principal,
    query: &HashMap<String, String>,
    host: Option<&str>,
) -> Result<WorkspaceId, ResolveError> {
    match mode {
        ResolutionMode::Query => {
            let workspace = query_param(query, &["workspace", "replId"])
                .ok_or(ResolveError::MissingWorkspace)?;
            let owner =
                query_param(query, &["owner", "username"]).ok_or(ResolveError::MissingOwner)?;
            if owner != principal.name {
                return Err(ResolveError::OwnerMismatch {
                    owner: owner.to_string(),
                    principal: principal.name.clone(),
                });
            }
            WorkspaceId::new(owner, workspace)
        }
        ResolutionMode::Host => {
            let workspace = host
                .and_then(workspace_from_host)
                .ok_or(ResolveError::MissingWorkspace)?;
            WorkspaceId::new(&principal.name, workspace)
        }
    }
}

fn query_param<'a>(query: &'a HashMap<String, String>, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .filter_map(|name| query.get(*name))
        .map(|v| v.trim())
        .find(|v| !v.is_empty())
}

/// Leading DNS label of a routable hostname, e.g. `proj1` for
/// `proj1.run.example.com:443`. Single-label hosts are not routable.
fn workspace_from_host(host: &str) -> Option<&str> {
    let hostname = host.rsplit_once(':').map_or(host, |(name, port)| {
        if port.chars().all(|c| c.is_ascii_digit()) {
            name
        } else {
            host
        }
    });
    let (label, rest) = hostname.split_once('.')?;
    if label.is_empty() || rest.is_empty() {
        return None;
    }
    Some(label)
}
