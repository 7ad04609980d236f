//! Client → Server messages

use serde::{Deserialize, Serialize};

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    // File tree
    FetchDirectory {
        request_id: String,
        #[serde(default)]
        path: String,
    },
    FetchContent {
        request_id: String,
        path: String,
    },
    UpdateContent {
        path: String,
        content: String,
    },

    // Terminal
    RequestTerminal,
    TerminalInput {
        data: String,
    },
    ResizeTerminal {
        cols: u16,
        rows: u16,
    },
    ClearTerminal,
}
