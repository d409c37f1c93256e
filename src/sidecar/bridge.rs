//! Native bridge into the embedded runtime.
//!
//! The bridge call takes an argv, starts the runtime and does not return
//! until the runtime's entry point returns (or the process is torn down).
//! There is no way to interrupt it from this side.

use std::path::PathBuf;
use std::process::{Command, Stdio};

use tracing::{error, info};

/// Bridge signal for "could not allocate the argument buffer / spawn".
pub const BRIDGE_ALLOCATION_FAILED: i32 = -1;

/// Bridge signal for "returned without a launch-time fault".
pub const BRIDGE_OK: i32 = 0;

/// Entry point into an embedded runtime (dyn-compatible).
///
/// `argv[0]` is the interpreter marker; the rest are flags and the entry
/// script path. Implementations block for the runtime's whole lifetime.
pub trait NativeBridge: Send + Sync {
    /// Start the runtime and block until it returns.
    ///
    /// `0` = no launch-time fault, negative = resource/allocation fault,
    /// other nonzero = runtime-specific fault.
    fn start(&self, argv: &[String]) -> i32;

    /// Display name used in logs.
    fn name(&self) -> String;
}

/// Bridge that runs the runtime as a child process of the host.
///
/// Used where no in-process runtime library is linked: `argv[0]` is replaced
/// by `runtime_binary` and the call blocks on the child's exit status.
#[derive(Debug, Clone)]
pub struct ProcessBridge {
    runtime_binary: PathBuf,
}

impl ProcessBridge {
    pub fn new(runtime_binary: impl Into<PathBuf>) -> Self {
        Self {
            runtime_binary: runtime_binary.into(),
        }
    }
}

impl NativeBridge for ProcessBridge {
    fn start(&self, argv: &[String]) -> i32 {
        let args = argv.get(1..).unwrap_or_default();
        info!(binary = %self.runtime_binary.display(), ?args, "Spawning runtime");

        // stdout carries IPC events; the runtime's output goes to stderr.
        let spawned = Command::new(&self.runtime_binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(std::io::stderr()))
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                error!("Failed to spawn {}: {}", self.runtime_binary.display(), e);
                return BRIDGE_ALLOCATION_FAILED;
            }
        };

        match child.wait() {
            // Killed by a signal: no exit code, report a distinct fault.
            Ok(status) => status.code().unwrap_or(128),
            Err(e) => {
                error!("Failed to wait for runtime: {}", e);
                BRIDGE_ALLOCATION_FAILED
            }
        }
    }

    fn name(&self) -> String {
        format!("process ({})", self.runtime_binary.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_binary_is_allocation_fault() {
        let bridge = ProcessBridge::new("/nonexistent/runtime-binary");
        let argv = vec!["node".to_string(), "/tmp/main.js".to_string()];
        assert_eq!(bridge.start(&argv), BRIDGE_ALLOCATION_FAILED);
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_code_is_returned() {
        let bridge = ProcessBridge::new("sh");
        let ok = vec!["sh".to_string(), "-c".to_string(), "exit 0".to_string()];
        assert_eq!(bridge.start(&ok), BRIDGE_OK);

        let fault = vec!["sh".to_string(), "-c".to_string(), "exit 7".to_string()];
        assert_eq!(bridge.start(&fault), 7);
    }
}
