//! Ordered execution of state-changing commands.
//!
//! Commands from the shell must be applied in the order they arrived, so
//! they go through one queue drained by a single task that awaits each
//! operation before taking the next.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{SessionCoordinator, SessionError};

/// A queued state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOp {
    SelectBundle(String),
    StartSidecar,
    StartFallback,
    Stop,
}

impl SessionOp {
    async fn apply(self, coordinator: &SessionCoordinator) -> Result<(), SessionError> {
        match self {
            Self::SelectBundle(name) => coordinator.select_bundle(&name).await,
            Self::StartSidecar => coordinator.start_sidecar().await,
            Self::StartFallback => coordinator.start_fallback().await,
            Self::Stop => coordinator.stop().await,
        }
    }
}

/// Called with every operation that failed, in queue order.
pub type FailureCallback = Arc<dyn Fn(&SessionOp, &SessionError) + Send + Sync>;

/// Spawn the worker. It exits once every sender is dropped.
pub fn spawn_op_worker(
    coordinator: Arc<SessionCoordinator>,
    on_failure: FailureCallback,
) -> (mpsc::UnboundedSender<SessionOp>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<SessionOp>();

    let task = tokio::spawn(async move {
        while let Some(op) = rx.recv().await {
            debug!(?op, "Applying session op");
            if let Err(e) = op.clone().apply(&coordinator).await {
                warn!(?op, "Session op failed: {}", e);
                on_failure(&op, &e);
            }
        }
        debug!("Session op worker exiting");
    });

    (tx, task)
}
