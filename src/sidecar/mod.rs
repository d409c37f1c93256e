//! Sidecar supervisor: launches a staged bundle through the native bridge.
//!
//! The bridge call blocks for the runtime's entire lifetime, so it runs on
//! its own named OS thread and its result comes back through a oneshot.
//! A bridge result of `0` only means "no launch-time fault"; whether the
//! sidecar's HTTP listener is accepting connections is confirmed elsewhere.

pub mod bridge;

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::session::state::{FailureReason, Transport, TransportState};
use bridge::{NativeBridge, BRIDGE_ALLOCATION_FAILED, BRIDGE_OK};

/// Signal recorded when the bridge implementation panics.
pub const BRIDGE_PANICKED: i32 = -2;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchError {
    /// A launch is already in flight or running; nothing was started.
    AlreadyActive,
    /// The bridge could not allocate what it needed to start the runtime.
    BridgeAllocationFailed,
    /// The runtime reported a fault with the given code.
    BridgeFault(i32),
}

impl LaunchError {
    /// Map a bridge return signal to a launch outcome.
    pub fn from_signal(code: i32) -> Result<(), LaunchError> {
        match code {
            BRIDGE_OK => Ok(()),
            BRIDGE_ALLOCATION_FAILED => Err(LaunchError::BridgeAllocationFailed),
            other => Err(LaunchError::BridgeFault(other)),
        }
    }
}

impl fmt::Display for LaunchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyActive => write!(f, "a sidecar launch is already active"),
            Self::BridgeAllocationFailed => write!(f, "native bridge failed to allocate launch resources"),
            Self::BridgeFault(code) => write!(f, "sidecar runtime fault (code {})", code),
        }
    }
}

impl std::error::Error for LaunchError {}

// ---------------------------------------------------------------------------
// Launch arguments and handle
// ---------------------------------------------------------------------------

/// How the argument vector for the bridge is assembled.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// `argv[0]`, the interpreter marker.
    pub interpreter: String,
    /// Flags placed before the entry script (e.g. `--trace-warnings`).
    pub diagnostic_flags: Vec<String>,
}

impl LaunchSpec {
    pub fn argv(&self, entry: &Path, extra_args: &[String]) -> Vec<String> {
        let mut argv = Vec::with_capacity(2 + self.diagnostic_flags.len() + extra_args.len());
        argv.push(self.interpreter.clone());
        argv.extend(self.diagnostic_flags.iter().cloned());
        argv.push(entry.to_string_lossy().to_string());
        argv.extend(extra_args.iter().cloned());
        argv
    }
}

/// What the supervisor knows about the current (or last) launch.
///
/// The OS-level process, if any, belongs to the bridge; this is a record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SidecarProcessHandle {
    pub launch_id: String,
    pub argv: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub last_result: Option<i32>,
}

/// Returned by a successful [`SidecarSupervisor::launch`].
pub struct LaunchHandle {
    pub launch_id: String,
    outcome_rx: oneshot::Receiver<Result<(), LaunchError>>,
}

impl LaunchHandle {
    /// Wait for the bridge call to return and get its interpreted result.
    ///
    /// For a long-running sidecar this resolves only when the runtime exits.
    pub async fn outcome(self) -> Result<(), LaunchError> {
        self.outcome_rx
            .await
            .unwrap_or(Err(LaunchError::BridgeFault(BRIDGE_PANICKED)))
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

struct Inner {
    state: TransportState,
    handle: Option<SidecarProcessHandle>,
}

/// Owns the launch lifecycle of the single sidecar this process may run.
pub struct SidecarSupervisor {
    bridge: Arc<dyn NativeBridge>,
    launch_spec: LaunchSpec,
    inner: Arc<Mutex<Inner>>,
    /// True while a bridge call is blocking on its worker thread.
    worker_alive: Arc<AtomicBool>,
}

impl SidecarSupervisor {
    pub fn new(bridge: Arc<dyn NativeBridge>, launch_spec: LaunchSpec) -> Self {
        Self {
            bridge,
            launch_spec,
            inner: Arc::new(Mutex::new(Inner {
                state: TransportState::Idle,
                handle: None,
            })),
            worker_alive: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the staged bundle's entry file on a dedicated worker thread.
    ///
    /// Returns immediately. Rejected with [`LaunchError::AlreadyActive`]
    /// while another launch is `Launching`/`Running`, or while a previous
    /// bridge call is still blocking (one live runtime per process).
    pub fn launch(
        &self,
        staged_dir: &Path,
        entry_file: &str,
        extra_args: &[String],
    ) -> Result<LaunchHandle, LaunchError> {
        let mut inner = lock(&self.inner);

        let active = matches!(
            inner.state,
            TransportState::Launching | TransportState::Running(Transport::Sidecar)
        );
        if active || self.worker_alive.load(Ordering::Acquire) {
            warn!(state = %inner.state, "Sidecar launch rejected: already active");
            return Err(LaunchError::AlreadyActive);
        }

        let entry = absolute_path(&staged_dir.join(entry_file));
        let argv = self.launch_spec.argv(&entry, extra_args);
        let launch_id = uuid::Uuid::new_v4().to_string();

        inner.state = TransportState::Launching;
        inner.handle = Some(SidecarProcessHandle {
            launch_id: launch_id.clone(),
            argv: argv.clone(),
            started_at: Utc::now(),
            last_result: None,
        });
        self.worker_alive.store(true, Ordering::Release);

        let (tx, rx) = oneshot::channel();
        let bridge = Arc::clone(&self.bridge);
        let shared = Arc::clone(&self.inner);
        let worker_alive = Arc::clone(&self.worker_alive);
        let worker_launch_id = launch_id.clone();

        info!(bridge = %bridge.name(), ?argv, launch_id = %launch_id, "Launching sidecar");

        let spawned = std::thread::Builder::new()
            .name("sidecar-bridge".to_string())
            .spawn(move || {
                let code = catch_unwind(AssertUnwindSafe(|| bridge.start(&argv)))
                    .unwrap_or(BRIDGE_PANICKED);
                worker_alive.store(false, Ordering::Release);
                let outcome = record_result(&shared, &worker_launch_id, code);
                // Receiver may be gone if nobody is waiting on the outcome.
                let _ = tx.send(outcome);
            });

        if let Err(e) = spawned {
            error!("Failed to spawn sidecar worker thread: {}", e);
            self.worker_alive.store(false, Ordering::Release);
            inner.state = TransportState::Failed(FailureReason::from(&LaunchError::BridgeAllocationFailed));
            return Err(LaunchError::BridgeAllocationFailed);
        }

        Ok(LaunchHandle {
            launch_id,
            outcome_rx: rx,
        })
    }

    /// Current lifecycle state as seen by the supervisor.
    pub fn current_state(&self) -> TransportState {
        lock(&self.inner).state.clone()
    }

    /// Snapshot of the current (or last) launch record.
    pub fn handle(&self) -> Option<SidecarProcessHandle> {
        lock(&self.inner).handle.clone()
    }

    /// Whether a bridge call is still blocking on its worker.
    pub fn is_worker_alive(&self) -> bool {
        self.worker_alive.load(Ordering::Acquire)
    }

    /// Readiness was confirmed out-of-band: `Launching -> Running(Sidecar)`.
    pub fn mark_ready(&self) -> bool {
        let mut inner = lock(&self.inner);
        if inner.state == TransportState::Launching {
            inner.state = TransportState::Running(Transport::Sidecar);
            info!("Sidecar readiness confirmed");
            true
        } else {
            false
        }
    }

    /// Stop treating the sidecar as active.
    ///
    /// The bridge call itself cannot be interrupted: if the runtime is still
    /// running it keeps running until its entry point returns, and a new
    /// launch is rejected until then.
    pub fn release(&self) {
        let mut inner = lock(&self.inner);
        if matches!(
            inner.state,
            TransportState::Launching | TransportState::Running(Transport::Sidecar)
        ) {
            inner.state = TransportState::Stopped;
        }
        if self.worker_alive.load(Ordering::Acquire) {
            warn!("Sidecar released while its bridge call is still running; it cannot be interrupted");
        } else {
            info!("Sidecar released");
        }
    }
}

/// Apply a bridge return signal to the shared state and interpret it.
fn record_result(shared: &Mutex<Inner>, launch_id: &str, code: i32) -> Result<(), LaunchError> {
    let outcome = LaunchError::from_signal(code);
    let mut inner = lock(shared);

    let current = inner
        .handle
        .as_ref()
        .map(|h| h.launch_id == launch_id)
        .unwrap_or(false);
    if let Some(handle) = inner.handle.as_mut().filter(|_| current) {
        handle.last_result = Some(code);
    }

    let active = matches!(
        inner.state,
        TransportState::Launching | TransportState::Running(Transport::Sidecar)
    );

    match &outcome {
        Ok(()) => {
            if inner.state == TransportState::Launching {
                inner.state = TransportState::Running(Transport::Sidecar);
            }
            info!(code, "Sidecar bridge returned without launch fault (listener readiness unconfirmed)");
        }
        Err(e) => {
            if current && active {
                inner.state = TransportState::Failed(FailureReason::from(e));
            }
            error!(code, "Sidecar bridge reported failure: {}", e);
        }
    }

    outcome
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn absolute_path(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    /// Returns a fixed signal and counts invocations.
    struct FixedBridge {
        code: i32,
        calls: AtomicUsize,
    }

    impl FixedBridge {
        fn new(code: i32) -> Arc<Self> {
            Arc::new(Self {
                code,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl NativeBridge for FixedBridge {
        fn start(&self, _argv: &[String]) -> i32 {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.code
        }

        fn name(&self) -> String {
            "fixed".into()
        }
    }

    /// Blocks until released, like a real runtime serving requests.
    struct BlockingBridge {
        release: Mutex<mpsc::Receiver<i32>>,
        calls: AtomicUsize,
    }

    impl NativeBridge for BlockingBridge {
        fn start(&self, _argv: &[String]) -> i32 {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.release.lock().unwrap().recv().unwrap_or(0)
        }

        fn name(&self) -> String {
            "blocking".into()
        }
    }

    fn launch_spec() -> LaunchSpec {
        LaunchSpec {
            interpreter: "node".into(),
            diagnostic_flags: vec!["--trace-warnings".into()],
        }
    }

    #[test]
    fn test_argv_layout() {
        let argv = launch_spec().argv(Path::new("/data/files/weather/main.js"), &["--port=3000".into()]);
        assert_eq!(
            argv,
            vec!["node", "--trace-warnings", "/data/files/weather/main.js", "--port=3000"]
        );
    }

    #[test]
    fn test_signal_mapping() {
        assert_eq!(LaunchError::from_signal(0), Ok(()));
        assert_eq!(
            LaunchError::from_signal(-1),
            Err(LaunchError::BridgeAllocationFailed)
        );
        assert_eq!(LaunchError::from_signal(9), Err(LaunchError::BridgeFault(9)));
        assert_eq!(LaunchError::from_signal(-5), Err(LaunchError::BridgeFault(-5)));
    }

    #[tokio::test]
    async fn test_zero_signal_means_running() {
        let bridge = FixedBridge::new(0);
        let supervisor = SidecarSupervisor::new(bridge.clone(), launch_spec());

        let handle = supervisor.launch(Path::new("/staged/weather"), "main.js", &[]).unwrap();
        assert_eq!(handle.outcome().await, Ok(()));
        assert_eq!(
            supervisor.current_state(),
            TransportState::Running(Transport::Sidecar)
        );
        assert_eq!(supervisor.handle().unwrap().last_result, Some(0));
    }

    #[tokio::test]
    async fn test_allocation_failure_signal() {
        let supervisor = SidecarSupervisor::new(FixedBridge::new(-1), launch_spec());
        let handle = supervisor.launch(Path::new("/staged/weather"), "main.js", &[]).unwrap();
        assert_eq!(handle.outcome().await, Err(LaunchError::BridgeAllocationFailed));
        assert_eq!(
            supervisor.current_state(),
            TransportState::Failed(FailureReason::BridgeAllocationFailed)
        );
    }

    #[tokio::test]
    async fn test_fault_signal_carries_code() {
        let supervisor = SidecarSupervisor::new(FixedBridge::new(12), launch_spec());
        let handle = supervisor.launch(Path::new("/staged/weather"), "main.js", &[]).unwrap();
        assert_eq!(handle.outcome().await, Err(LaunchError::BridgeFault(12)));
        assert_eq!(
            supervisor.current_state(),
            TransportState::Failed(FailureReason::BridgeFault { code: 12 })
        );

        // A failed launch may be retried explicitly.
        let retry = supervisor.launch(Path::new("/staged/weather"), "main.js", &[]);
        assert!(retry.is_ok());
    }

    #[tokio::test]
    async fn test_second_launch_rejected_while_running() {
        let bridge = FixedBridge::new(0);
        let supervisor = SidecarSupervisor::new(bridge.clone(), launch_spec());
        supervisor
            .launch(Path::new("/staged/weather"), "main.js", &[])
            .unwrap()
            .outcome()
            .await
            .unwrap();

        let second = supervisor.launch(Path::new("/staged/weather"), "main.js", &[]);
        assert_eq!(second.err(), Some(LaunchError::AlreadyActive));
        assert_eq!(bridge.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_second_launch_rejected_while_launching() {
        let (tx, rx) = mpsc::channel();
        let bridge = Arc::new(BlockingBridge {
            release: Mutex::new(rx),
            calls: AtomicUsize::new(0),
        });
        let supervisor = SidecarSupervisor::new(bridge.clone(), launch_spec());

        let first = supervisor.launch(Path::new("/staged/weather"), "main.js", &[]).unwrap();
        assert_eq!(supervisor.current_state(), TransportState::Launching);

        let second = supervisor.launch(Path::new("/staged/weather"), "main.js", &[]);
        assert_eq!(second.err(), Some(LaunchError::AlreadyActive));

        tx.send(0).unwrap();
        assert_eq!(first.outcome().await, Ok(()));
        assert_eq!(bridge.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_release_does_not_allow_relaunch_while_worker_blocks() {
        let (tx, rx) = mpsc::channel();
        let bridge = Arc::new(BlockingBridge {
            release: Mutex::new(rx),
            calls: AtomicUsize::new(0),
        });
        let supervisor = SidecarSupervisor::new(bridge.clone(), launch_spec());

        let first = supervisor.launch(Path::new("/staged/weather"), "main.js", &[]).unwrap();
        assert!(supervisor.mark_ready());
        supervisor.release();
        assert_eq!(supervisor.current_state(), TransportState::Stopped);
        assert!(supervisor.is_worker_alive());

        let second = supervisor.launch(Path::new("/staged/weather"), "main.js", &[]);
        assert_eq!(second.err(), Some(LaunchError::AlreadyActive));

        tx.send(3).unwrap();
        assert_eq!(first.outcome().await, Err(LaunchError::BridgeFault(3)));
        // Released before the fault arrived: stays stopped.
        assert_eq!(supervisor.current_state(), TransportState::Stopped);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!supervisor.is_worker_alive());
    }
}
