//! Mobile context server host binary.
//!
//! Communicates with the mobile shell via JSON-line IPC on stdin/stdout.
//! Initializes logging and configuration, builds the session coordinator,
//! and runs the main command loop.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use mobile_context_server::config::read_host_config;
use mobile_context_server::ipc::bridge::{emit_error, emit_event, spawn_stdin_reader};
use mobile_context_server::ipc::{HostCommand, HostEvent};
use mobile_context_server::logger;
use mobile_context_server::session::ops::{spawn_op_worker, SessionOp};
use mobile_context_server::session::{SessionCoordinator, SessionError, SessionParts};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Emit starting event immediately so the shell knows we're alive.
    emit_event(&HostEvent::Starting {});

    let config = read_host_config();
    let log_path = logger::init_or_stderr(&config.log_dir());
    info!(?config, "Configuration loaded");

    let catalog_dir = config.catalog_dir();
    std::fs::create_dir_all(&catalog_dir)
        .with_context(|| format!("creating catalog dir {}", catalog_dir.display()))?;

    let port = config.port;
    let parts = SessionParts::from_config(&config);
    let coordinator = Arc::new(SessionCoordinator::new(config, log_path.clone(), parts));

    let (op_tx, op_worker) = spawn_op_worker(
        Arc::clone(&coordinator),
        Arc::new(|_op: &SessionOp, e: &SessionError| emit_error(&e.to_string())),
    );
    let mut cmd_rx = spawn_stdin_reader();
    let mut state_rx = coordinator.subscribe();
    let mut listener_rx = coordinator.listener_events();

    emit_event(&HostEvent::Ready {
        port,
        log_path: log_path.display().to_string(),
    });
    info!(port, "Host ready");

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(command) => {
                        if !handle_command(&coordinator, &op_tx, command) {
                            break;
                        }
                    }
                    None => {
                        // stdin closed: shell gone
                        info!("stdin closed, shutting down");
                        break;
                    }
                }
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = state_rx.borrow_and_update().clone();
                emit_event(&HostEvent::State(snapshot));
            }
            status = listener_rx.recv() => {
                match status {
                    Ok(status) => emit_event(&HostEvent::Listener(status)),
                    Err(RecvError::Lagged(n)) => warn!(skipped = n, "Listener events lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    // Let queued transitions finish before the final stop.
    drop(op_tx);
    if let Err(e) = op_worker.await {
        error!("Session op worker failed: {}", e);
    }
    if let Err(e) = coordinator.stop().await {
        error!("Stop during shutdown failed: {}", e);
    }
    info!("Host shutting down");
    Ok(())
}

/// Dispatch a single command from the shell.
///
/// State transitions are queued so they apply in arrival order. Session
/// start and the endpoint self-test wait on the network and run detached.
/// Returns `false` if the loop should exit.
fn handle_command(
    coordinator: &Arc<SessionCoordinator>,
    op_tx: &mpsc::UnboundedSender<SessionOp>,
    cmd: HostCommand,
) -> bool {
    let op = match cmd {
        HostCommand::Ping {} => {
            emit_event(&HostEvent::Pong {});
            return true;
        }

        HostCommand::Shutdown {} => {
            emit_event(&HostEvent::Stopping {});
            return false;
        }

        HostCommand::Status {} => {
            emit_event(&HostEvent::Status(coordinator.snapshot()));
            return true;
        }

        HostCommand::ListBundles {} => {
            match coordinator.list_bundles() {
                Ok(names) => emit_event(&HostEvent::Bundles { names }),
                Err(e) => emit_error(&e.to_string()),
            }
            return true;
        }

        HostCommand::SelectBundle { name } => SessionOp::SelectBundle(name),
        HostCommand::StartSidecar {} => SessionOp::StartSidecar,
        HostCommand::StartFallback {} => SessionOp::StartFallback,
        HostCommand::Stop {} => SessionOp::Stop,

        HostCommand::StartSession {} => {
            let coordinator = Arc::clone(coordinator);
            tokio::spawn(async move {
                match coordinator.start_session().await {
                    Ok(port) => emit_event(&HostEvent::ClientConnected { port }),
                    Err(e) => emit_event(&HostEvent::ClientFailed {
                        message: e.to_string(),
                    }),
                }
            });
            return true;
        }

        HostCommand::TestEndpoint {} => {
            let coordinator = Arc::clone(coordinator);
            tokio::spawn(async move {
                let report = coordinator.test_endpoint().await;
                emit_event(&HostEvent::ProbeResult(report));
            });
            return true;
        }
    };

    if op_tx.send(op).is_err() {
        error!("Session op worker is gone");
        return false;
    }
    true
}
