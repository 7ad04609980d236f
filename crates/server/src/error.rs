//! Connection-level error taxonomy.
//!
//! Every failure a connection can observe funnels into [`GatewayError`],
//! which decides how far it propagates: handshake errors become HTTP
//! rejections, per-request errors become a wire `error` for that request,
//! and background errors are only logged.

use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use replhost_protocol::ServerMessage;
use thiserror::Error;

use crate::auth::AuthError;
use crate::cache::HydrationError;
use crate::compute::ComputeError;
use crate::storage::StorageError;
use crate::terminal::TerminalError;
use crate::workspace::ResolveError;
use crate::workspace_fs::FsError;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    WorkspaceResolution(#[from] ResolveError),
    #[error("workspace hydration failed: {0}")]
    Hydration(#[from] HydrationError),
    #[error(transparent)]
    ProcessSpawn(#[from] TerminalError),
    /// Failed file request: not found, invalid path or I/O
    #[error(transparent)]
    File(#[from] FsError),
    #[error("push to object storage failed: {0}")]
    RemoteSync(#[from] StorageError),
    #[error("push to object storage timed out after {0:?}")]
    RemoteSyncTimeout(Duration),
    #[error("remote sync queue is full, write dropped")]
    RemoteSyncQueueFull,
    #[error("stop workspace compute failed: {0}")]
    Teardown(#[from] ComputeError),
}

impl GatewayError {
    /// Stable code sent to clients in `error` messages
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Auth(_) => "unauthorized",
            GatewayError::WorkspaceResolution(ResolveError::OwnerMismatch { .. }) => "forbidden",
            GatewayError::WorkspaceResolution(_) => "invalid_workspace",
            GatewayError::Hydration(_) => "hydration_failed",
            GatewayError::ProcessSpawn(_) => "terminal_spawn_failed",
            GatewayError::File(e) => e.code(),
            GatewayError::RemoteSync(_)
            | GatewayError::RemoteSyncTimeout(_)
            | GatewayError::RemoteSyncQueueFull => {
                "remote_sync_failed"
            }
            GatewayError::Teardown(_) => "teardown_failed",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Auth(_) => StatusCode::UNAUTHORIZED,
            GatewayError::WorkspaceResolution(ResolveError::OwnerMismatch { .. }) => {
                StatusCode::FORBIDDEN
            }
            GatewayError::WorkspaceResolution(_) => StatusCode::BAD_REQUEST,
            GatewayError::File(FsError::NotFound(_)) => StatusCode::NOT_FOUND,
            GatewayError::File(FsError::InvalidPath(_)) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn to_message(&self, request_id: Option<String>) -> ServerMessage {
        ServerMessage::Error {
            code: self.code().to_string(),
            message: self.to_string(),
            request_id,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}
