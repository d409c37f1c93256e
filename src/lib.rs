//! Mobile context server host.
//!
//! Stages a server bundle into writable storage, launches it through the
//! embedded runtime bridge, and falls back to an in-process HTTP liveness
//! responder when the sidecar path is unavailable. The session coordinator
//! owns the single transport state machine tying these together.

pub mod bundle;
pub mod config;
pub mod fallback;
pub mod ipc;
pub mod logger;
pub mod session;
pub mod sidecar;
