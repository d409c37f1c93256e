//! IPC protocol types for communication with the mobile shell.
//!
//! Events use `{"event": "<name>", "data": {...}}` format (host -> shell).
//! Commands use `{"command": "<name>", ...}` format (shell -> host).

pub mod bridge;

use serde::{Deserialize, Serialize};

use crate::fallback::ListenerStatus;
use crate::session::readiness::ProbeReport;
use crate::session::state::SessionSnapshot;

// ---------------------------------------------------------------------------
// Events: host -> shell (stdout)
// ---------------------------------------------------------------------------

/// All events emitted to the shell via stdout as JSON lines.
///
/// Serialized as `{"event": "<variant>", "data": {...}}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum HostEvent {
    Starting {},
    Ready {
        port: u16,
        #[serde(rename = "logPath")]
        log_path: String,
    },
    Bundles { names: Vec<String> },
    /// Every transport state change.
    State(SessionSnapshot),
    /// Reply to `status`; same payload as `State`.
    Status(SessionSnapshot),
    Listener(ListenerStatus),
    ClientConnected { port: u16 },
    ClientFailed { message: String },
    ProbeResult(ProbeReport),
    Error { message: String },
    Pong {},
    Stopping {},
}

// ---------------------------------------------------------------------------
// Commands: shell -> host (stdin)
// ---------------------------------------------------------------------------

/// All commands received from the shell via stdin as JSON lines.
///
/// Deserialized from `{"command": "<variant>", ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "command")]
#[serde(rename_all = "snake_case")]
pub enum HostCommand {
    ListBundles {},
    SelectBundle { name: String },
    StartSidecar {},
    StartFallback {},
    Stop {},
    StartSession {},
    TestEndpoint {},
    Status {},
    Ping {},
    Shutdown {},
}
