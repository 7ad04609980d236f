//! Server → Client messages

use serde::{Deserialize, Serialize};

use crate::types::FileNode;

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    // Lifecycle
    WorkspaceLoaded {
        workspace: String,
        root_content: Vec<FileNode>,
    },

    // File tree
    DirectoryListing {
        request_id: String,
        path: String,
        nodes: Vec<FileNode>,
    },
    FileContent {
        request_id: String,
        path: String,
        content: String,
    },
    ContentSaved {
        path: String,
    },

    // Terminal
    TerminalReady,
    /// Base64-encoded PTY output
    TerminalOutput {
        data: String,
    },

    // Errors
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}
