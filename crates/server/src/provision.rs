//! `POST /api/workspaces`: seed a new workspace from a template prefix.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{error, info};

use crate::auth::Principal;
use crate::state::AppState;
use crate::storage::StorageError;
use crate::workspace::{validate_identifier, ResolveError, WorkspaceId};

#[derive(Debug, Deserialize)]
pub struct CreateWorkspaceRequest {
    pub workspace: String,
    /// Template name under the template class, e.g. `node`
    pub template: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateWorkspaceResponse {
    pub created: bool,
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    InvalidName(#[from] ResolveError),
    #[error("template {0:?} has no objects")]
    TemplateNotFound(String),
    #[error("copying template failed: {0}")]
    Storage(#[from] StorageError),
}

impl IntoResponse for ProvisionError {
    fn into_response(self) -> Response {
        let status = match self {
            ProvisionError::InvalidName(_) => StatusCode::BAD_REQUEST,
            ProvisionError::TemplateNotFound(_) => StatusCode::NOT_FOUND,
            ProvisionError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub async fn create_workspace_handler(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Json(request): Json<CreateWorkspaceRequest>,
) -> Result<(StatusCode, Json<CreateWorkspaceResponse>), ProvisionError> {
    let response = provision_workspace(&state, &principal, &request).await?;
    let status = if response.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(response)))
}

/// Copy `<template_class>/<template>` into the principal's workspace unless
/// the workspace already has objects.
async fn provision_workspace(
    state: &AppState,
    principal: &Principal,
    request: &CreateWorkspaceRequest,
) -> Result<CreateWorkspaceResponse, ProvisionError> {
    let workspace = WorkspaceId::new(&principal.name, request.workspace.trim())?;
    let template = validate_identifier(request.template.trim())?;
    let destination = state.cache.remote_prefix(&workspace);

    if state.storage.has_objects(&destination).await? {
        info!(
            component = "provision",
            event = "provision.exists",
            workspace = %workspace,
            "Workspace already provisioned"
        );
        return Ok(CreateWorkspaceResponse { created: false });
    }

    let source = format!("{}/{}", state.template_class, template);
    if !state.storage.has_objects(&source).await? {
        return Err(ProvisionError::TemplateNotFound(template));
    }

    match state.storage.copy_prefix(&source, &destination).await {
        Ok(copied) => {
            state.cache.invalidate(&workspace);
            info!(
                component = "provision",
                event = "provision.created",
                workspace = %workspace,
                template = %template,
                objects = copied,
                "Workspace provisioned from template"
            );
            Ok(CreateWorkspaceResponse { created: true })
        }
        Err(e) => {
            error!(
                component = "provision",
                event = "provision.copy_failed",
                workspace = %workspace,
                template = %template,
                error = %e,
                "Template copy failed"
            );
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use crate::storage::tests::seed;
    use crate::storage::RemoteStore;
    use crate::workspace::ResolutionMode;
    use crate::workspace_fs::list_directory;

    fn alice() -> Principal {
        Principal {
            name: "alice".into(),
        }
    }

    fn request(workspace: &str, template: &str) -> CreateWorkspaceRequest {
        CreateWorkspaceRequest {
            workspace: workspace.into(),
            template: template.into(),
        }
    }

    #[tokio::test]
    async fn copies_template_into_new_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let test = test_state(dir.path(), ResolutionMode::Query);
        seed(
            test.backend.as_ref(),
            &[
                ("base/node/index.js", "a"),
                ("base/node/package.json", "b"),
                ("base/node/src/app.js", "c"),
            ],
        )
        .await;

        let response = provision_workspace(&test.state, &alice(), &request("proj1", "node"))
            .await
            .unwrap();
        assert_eq!(response, CreateWorkspaceResponse { created: true });
        for (key, body) in [
            ("code/alice/proj1/index.js", "a"),
            ("code/alice/proj1/package.json", "b"),
            ("code/alice/proj1/src/app.js", "c"),
        ] {
            assert_eq!(test.backend.get(key).await.unwrap(), bytes::Bytes::from(body));
        }
    }

    #[tokio::test]
    async fn existing_workspace_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let test = test_state(dir.path(), ResolutionMode::Query);
        seed(
            test.backend.as_ref(),
            &[
                ("base/node/index.js", "template"),
                ("code/alice/proj1/index.js", "mine"),
            ],
        )
        .await;

        let response = provision_workspace(&test.state, &alice(), &request("proj1", "node"))
            .await
            .unwrap();
        assert!(!response.created);
        assert_eq!(
            test.backend.get("code/alice/proj1/index.js").await.unwrap(),
            bytes::Bytes::from("mine")
        );
    }

    #[tokio::test]
    async fn unknown_template_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let test = test_state(dir.path(), ResolutionMode::Query);

        let err = provision_workspace(&test.state, &alice(), &request("proj1", "cobol"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::TemplateNotFound(_)));
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn rejects_invalid_workspace_name() {
        let dir = tempfile::tempdir().unwrap();
        let test = test_state(dir.path(), ResolutionMode::Query);

        let err = provision_workspace(&test.state, &alice(), &request("../etc", "node"))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn provisioning_replaces_an_earlier_empty_hydration() {
        let dir = tempfile::tempdir().unwrap();
        let test = test_state(dir.path(), ResolutionMode::Query);
        seed(
            test.backend.as_ref(),
            &[
                ("base/node/index.js", "a"),
                ("base/node/package.json", "b"),
                ("base/node/src/app.js", "c"),
            ],
        )
        .await;
        let workspace = WorkspaceId::new("alice", "proj1").unwrap();

        let local = test.state.cache.ensure(&workspace).await.unwrap();
        assert!(list_directory(&local, "").await.unwrap().is_empty());

        provision_workspace(&test.state, &alice(), &request("proj1", "node"))
            .await
            .unwrap();

        let local = test.state.cache.ensure(&workspace).await.unwrap();
        let paths: Vec<_> = list_directory(&local, "")
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.path)
            .collect();
        assert_eq!(paths, vec!["/index.js", "/package.json", "/src"]);
    }
}
