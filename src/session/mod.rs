//! Session coordinator: the single owner of `TransportState`.
//!
//! Sequences "stage -> launch -> readiness -> connect" for the sidecar path,
//! runs the fallback listener as the alternative transport, and keeps the
//! two mutually exclusive on the shared port. Everyone else sees the session
//! through immutable `SessionSnapshot`s from a watch channel.

pub mod client;
pub mod ops;
pub mod readiness;
pub mod state;

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

use crate::bundle::{self, BundleCatalog, ServerBundle, StageError};
use crate::config::HostConfig;
use crate::fallback::{BindError, FallbackListener, ListenerStatus};
use crate::sidecar::bridge::{NativeBridge, ProcessBridge};
use crate::sidecar::{LaunchError, LaunchHandle, LaunchSpec, SidecarSupervisor};

use client::{ConnectivityError, HttpProtocolClient, ProtocolClient};
use readiness::{HttpReadiness, ProbeReport, ReadinessCheck};
use state::{FailureReason, SessionSnapshot, Transport, TransportState};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No bundle has been selected yet.
    NoBundleSelected,
    /// The session is mid-transition (staging/launching) or running.
    Busy { state: String },
    Stage(StageError),
    Launch(LaunchError),
    Bind(BindError),
    /// The sidecar was launched but never became ready.
    NotReady(String),
    Connectivity(ConnectivityError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoBundleSelected => write!(f, "no bundle selected"),
            Self::Busy { state } => write!(f, "session is busy ({})", state),
            Self::Stage(e) => write!(f, "{}", e),
            Self::Launch(e) => write!(f, "{}", e),
            Self::Bind(e) => write!(f, "{}", e),
            Self::NotReady(detail) => write!(f, "sidecar not ready: {}", detail),
            Self::Connectivity(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SessionError {}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Collaborators the coordinator drives.
pub struct SessionParts {
    pub bridge: Arc<dyn NativeBridge>,
    pub readiness: Arc<dyn ReadinessCheck>,
    pub client: Arc<dyn ProtocolClient>,
}

impl SessionParts {
    /// Production collaborators built from config.
    pub fn from_config(config: &HostConfig) -> Self {
        Self {
            bridge: Arc::new(ProcessBridge::new(config.runtime_binary.clone())),
            readiness: Arc::new(HttpReadiness::new(
                config.settle_interval(),
                config.readiness_attempts,
                config.readiness_backoff(),
                config.probe_timeout(),
            )),
            client: Arc::new(HttpProtocolClient::new(config.probe_timeout())),
        }
    }
}

pub struct SessionCoordinator {
    config: HostConfig,
    catalog: BundleCatalog,
    supervisor: Arc<SidecarSupervisor>,
    fallback: FallbackListener,
    readiness: Arc<dyn ReadinessCheck>,
    client: Arc<dyn ProtocolClient>,
    /// Sole writer of the session state.
    snapshot_tx: Arc<watch::Sender<SessionSnapshot>>,
    listener_tx: broadcast::Sender<ListenerStatus>,
    selected: Mutex<Option<ServerBundle>>,
    /// Serializes transitions so check-then-act is atomic.
    op_lock: tokio::sync::Mutex<()>,
}

impl SessionCoordinator {
    pub fn new(config: HostConfig, log_path: PathBuf, parts: SessionParts) -> Self {
        let catalog = BundleCatalog::new(
            config.catalog_dir(),
            config.staging_dir(),
            config.entry_file.clone(),
        );
        let supervisor = Arc::new(SidecarSupervisor::new(
            parts.bridge,
            LaunchSpec {
                interpreter: config.interpreter.clone(),
                diagnostic_flags: config.diagnostic_flags.clone(),
            },
        ));

        let (snapshot_tx, _) = watch::channel(SessionSnapshot {
            state: TransportState::Idle,
            bundle: None,
            status: "Idle".to_string(),
            log_path,
        });
        let snapshot_tx = Arc::new(snapshot_tx);
        let (listener_tx, _) = broadcast::channel(64);

        // Listener notifications refresh the status line only; state
        // transitions stay with the coordinator.
        let status_tx = Arc::clone(&snapshot_tx);
        let forward_tx = listener_tx.clone();
        let fallback = FallbackListener::new(Arc::new(move |status: ListenerStatus| {
            status_tx.send_modify(|snap| snap.status = status.to_string());
            let _ = forward_tx.send(status);
        }));

        Self {
            config,
            catalog,
            supervisor,
            fallback,
            readiness: parts.readiness,
            client: parts.client,
            snapshot_tx,
            listener_tx,
            selected: Mutex::new(None),
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Immutable snapshot of the session.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    pub fn state(&self) -> TransportState {
        self.snapshot_tx.borrow().state.clone()
    }

    /// Receive every snapshot change.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Receive fallback listener notifications.
    pub fn listener_events(&self) -> broadcast::Receiver<ListenerStatus> {
        self.listener_tx.subscribe()
    }

    pub fn supervisor(&self) -> &SidecarSupervisor {
        &self.supervisor
    }

    pub fn fallback(&self) -> &FallbackListener {
        &self.fallback
    }

    /// Names of the bundles available in the catalog.
    pub fn list_bundles(&self) -> Result<Vec<String>, SessionError> {
        self.catalog.list().map_err(SessionError::Stage)
    }

    /// Select the bundle later staged by `start_sidecar`.
    ///
    /// Refused while a transport is active. Switching to a different bundle
    /// discards the previously staged copy.
    pub async fn select_bundle(&self, name: &str) -> Result<(), SessionError> {
        let _op = self.op_lock.lock().await;
        let state = self.state();
        if !state.can_start() {
            self.set_status("Stop the running server before selecting another bundle");
            return Err(SessionError::Busy {
                state: state.to_string(),
            });
        }

        // A released runtime still blocking in the bridge is running from
        // the staged copy; switching would delete its files.
        if self.supervisor.is_worker_alive() {
            self.set_status("Previous sidecar is still running; its bundle cannot be switched yet");
            return Err(SessionError::Launch(LaunchError::AlreadyActive));
        }

        let bundle = self.catalog.bundle(name).map_err(SessionError::Stage)?;
        if !bundle.source_dir.is_dir() {
            let err = StageError::SourceUnreadable {
                path: bundle.source_dir.clone(),
                detail: "bundle not found in catalog".to_string(),
            };
            self.set_status(&format!("Unknown bundle {}", name));
            return Err(SessionError::Stage(err));
        }

        let previous = lock(&self.selected).replace(bundle);
        if let Some(old) = previous.filter(|old| old.name != name) {
            if let Err(e) = bundle::discard(&old) {
                warn!(bundle = %old.name, "Failed to discard staged bundle: {}", e);
            }
        }

        info!(bundle = %name, "Bundle selected");
        self.snapshot_tx.send_modify(|snap| {
            snap.state = TransportState::Idle;
            snap.bundle = Some(name.to_string());
            snap.status = format!("Selected bundle {}", name);
        });
        Ok(())
    }

    /// Stage the selected bundle and launch it through the bridge.
    ///
    /// Returns once the launch is issued; the bridge outcome is applied to
    /// the state asynchronously.
    pub async fn start_sidecar(&self) -> Result<(), SessionError> {
        let _op = self.op_lock.lock().await;
        self.begin_sidecar().await
    }

    /// Start the fallback listener on the configured port.
    ///
    /// Rejected without binding while the sidecar holds the port.
    pub async fn start_fallback(&self) -> Result<(), SessionError> {
        let _op = self.op_lock.lock().await;
        let port = self.config.port;
        let state = self.state();

        if state.sidecar_occupies_port() || self.supervisor.is_worker_alive() {
            let err = BindError::PortInUse { port };
            warn!(%state, "Fallback start rejected: sidecar holds port {}", port);
            self.set_status(&format!("Cannot start fallback server: {} (sidecar active)", err));
            return Err(SessionError::Bind(err));
        }

        match self.fallback.start(port).await {
            Ok(()) => {
                if state != TransportState::Running(Transport::Fallback) {
                    let bound = self.fallback.local_port().unwrap_or(port);
                    self.set_state(
                        TransportState::Running(Transport::Fallback),
                        format!("Fallback server running on port {}", bound),
                    );
                }
                Ok(())
            }
            Err(e) => {
                self.fail(FailureReason::from(&e), &format!("Fallback server failed: {}", e));
                Err(SessionError::Bind(e))
            }
        }
    }

    /// Stop whichever transport is running.
    pub async fn stop(&self) -> Result<(), SessionError> {
        let _op = self.op_lock.lock().await;
        match self.state() {
            TransportState::Running(Transport::Fallback) => {
                self.fallback.stop().await;
                self.set_state(TransportState::Stopped, "Fallback server stopped".to_string());
            }
            TransportState::Running(Transport::Sidecar) | TransportState::Launching => {
                self.supervisor.release();
                self.set_state(TransportState::Stopped, "Sidecar stopped".to_string());
            }
            other => info!(state = %other, "Stop requested with no active transport"),
        }
        Ok(())
    }

    /// Start a chat session against the local endpoint.
    ///
    /// When a transport is already running this only connects the client.
    /// Otherwise the sidecar is staged and launched first, and the client is
    /// connected once readiness is confirmed. Returns the connected port.
    pub async fn start_session(&self) -> Result<u16, SessionError> {
        let launched = {
            let _op = self.op_lock.lock().await;
            match self.state() {
                state if state.is_running() => false,
                state @ (TransportState::StagingBundle | TransportState::Launching) => {
                    return Err(SessionError::Busy {
                        state: state.to_string(),
                    });
                }
                _ => {
                    self.set_status("Starting the sidecar first...");
                    self.begin_sidecar().await?;
                    true
                }
            }
        };

        if launched {
            self.await_readiness().await?;
        }

        let port = match self.state() {
            TransportState::Running(Transport::Fallback) => {
                self.fallback.local_port().unwrap_or(self.config.port)
            }
            _ => self.config.port,
        };

        info!(port, client = %self.client.name(), "Connecting protocol client");
        match self.client.connect(port).await {
            Ok(()) => {
                self.set_status(&format!("Session connected on port {}", port));
                Ok(port)
            }
            Err(e) => {
                error!("Protocol client failed to connect: {}", e);
                self.set_status(&self.with_log_hint(&format!("Client connection failed: {}", e)));
                Err(SessionError::Connectivity(e))
            }
        }
    }

    /// Probe the configured candidate URLs and report the first answer.
    pub async fn test_endpoint(&self) -> ProbeReport {
        self.set_status("Probing local endpoint...");
        let report =
            readiness::probe_endpoints(&self.config.probe_urls(), self.config.probe_timeout()).await;
        match &report.url {
            Some(url) => self.set_status(&format!("Endpoint reachable at {}", url)),
            None => self.set_status(&self.with_log_hint(
                "Endpoint unreachable. Check that a server is running",
            )),
        }
        report
    }

    // -- internals ---------------------------------------------------------

    /// Stage + launch. Caller must hold `op_lock`.
    async fn begin_sidecar(&self) -> Result<(), SessionError> {
        let state = self.state();
        match state {
            TransportState::Running(Transport::Fallback) => {
                let err = BindError::PortInUse {
                    port: self.config.port,
                };
                self.set_status(&format!("Cannot start sidecar: {} (fallback active)", err));
                return Err(SessionError::Bind(err));
            }
            TransportState::Launching | TransportState::Running(Transport::Sidecar) => {
                return Err(SessionError::Launch(LaunchError::AlreadyActive));
            }
            TransportState::StagingBundle => {
                return Err(SessionError::Busy {
                    state: state.to_string(),
                });
            }
            _ => {}
        }

        // A released sidecar whose bridge call still blocks is using the
        // staged files; never restage underneath it.
        if self.supervisor.is_worker_alive() {
            self.set_status("Previous sidecar is still running and cannot be interrupted");
            return Err(SessionError::Launch(LaunchError::AlreadyActive));
        }

        let bundle = lock(&self.selected)
            .clone()
            .ok_or(SessionError::NoBundleSelected)?;

        self.set_state(
            TransportState::StagingBundle,
            format!("Staging bundle {}", bundle.name),
        );
        let to_stage = bundle.clone();
        let staged = tokio::task::spawn_blocking(move || bundle::stage(&to_stage))
            .await
            .unwrap_or_else(|e| {
                Err(StageError::WriteFailed {
                    path: bundle.staged_dir.clone(),
                    detail: format!("staging worker failed: {}", e),
                })
            });
        let staged_dir = match staged {
            Ok(dir) => dir,
            Err(e) => {
                error!(bundle = %bundle.name, "Staging failed: {}", e);
                self.fail(FailureReason::from(&e), &format!("Staging failed: {}", e));
                return Err(SessionError::Stage(e));
            }
        };

        self.set_state(
            TransportState::Launching,
            format!("Starting sidecar for {}", bundle.name),
        );
        let handle = match self.supervisor.launch(
            &staged_dir,
            &bundle.entry_file,
            &self.config.extra_args,
        ) {
            Ok(handle) => handle,
            Err(e) => {
                self.fail(FailureReason::from(&e), &format!("Sidecar launch failed: {}", e));
                return Err(SessionError::Launch(e));
            }
        };

        self.watch_outcome(handle);
        Ok(())
    }

    /// Apply the bridge result when (if ever) the bridge call returns.
    fn watch_outcome(&self, handle: LaunchHandle) {
        let snapshot_tx = Arc::clone(&self.snapshot_tx);
        let supervisor = Arc::clone(&self.supervisor);
        tokio::spawn(async move {
            let launch_id = handle.launch_id.clone();
            let outcome = handle.outcome().await;
            let current = supervisor
                .handle()
                .map(|h| h.launch_id == launch_id)
                .unwrap_or(false);
            if !current {
                info!(%launch_id, "Ignoring outcome of a superseded launch");
                return;
            }
            snapshot_tx.send_modify(|snap| {
                let sidecar_active = matches!(
                    snap.state,
                    TransportState::Launching | TransportState::Running(Transport::Sidecar)
                );
                match &outcome {
                    Ok(()) if snap.state == TransportState::Launching => {
                        info!(%launch_id, "Sidecar bridge returned 0; treating as running");
                        snap.state = TransportState::Running(Transport::Sidecar);
                        snap.status =
                            "Sidecar started (bridge returned 0, listener not yet confirmed)".into();
                    }
                    Ok(()) => info!(%launch_id, "Sidecar entry point returned"),
                    Err(e) if sidecar_active => {
                        snap.state = TransportState::Failed(FailureReason::from(e));
                        snap.status = format!(
                            "Sidecar failed: {}. See log: {}",
                            e,
                            snap.log_path.display()
                        );
                    }
                    Err(e) => warn!(%launch_id, "Sidecar fault after release: {}", e),
                }
            });
        });
    }

    /// Wait for the freshly launched sidecar, then promote it to Running.
    async fn await_readiness(&self) -> Result<(), SessionError> {
        self.set_status(&format!("Waiting for sidecar on port {}...", self.config.port));
        info!(check = %self.readiness.name(), "Waiting for sidecar readiness");
        let ready = self.readiness.wait_ready(self.config.port).await;

        let _op = self.op_lock.lock().await;
        let state = self.state();
        let sidecar_active = matches!(
            state,
            TransportState::Launching | TransportState::Running(Transport::Sidecar)
        );

        match ready {
            Ok(()) if sidecar_active => {
                self.supervisor.mark_ready();
                if state == TransportState::Launching {
                    self.set_state(
                        TransportState::Running(Transport::Sidecar),
                        format!("Sidecar ready on port {}", self.config.port),
                    );
                }
                Ok(())
            }
            // Failed (bridge fault) or stopped while we waited.
            Ok(()) => Err(SessionError::NotReady(format!(
                "session left the launch state ({})",
                state
            ))),
            Err(detail) => {
                if sidecar_active {
                    self.supervisor.release();
                    self.fail(
                        FailureReason::NotReady {
                            detail: detail.clone(),
                        },
                        &format!("Sidecar did not become ready: {}", detail),
                    );
                }
                Err(SessionError::NotReady(detail))
            }
        }
    }

    fn set_state(&self, state: TransportState, status: String) {
        info!(%state, "{}", status);
        self.snapshot_tx.send_modify(|snap| {
            snap.state = state;
            snap.status = status;
        });
    }

    fn set_status(&self, status: &str) {
        self.snapshot_tx
            .send_modify(|snap| snap.status = status.to_string());
    }

    fn fail(&self, reason: FailureReason, message: &str) {
        let status = self.with_log_hint(message);
        self.set_state(TransportState::Failed(reason), status);
    }

    fn with_log_hint(&self, message: &str) -> String {
        format!("{}. See log: {}", message, self.snapshot_tx.borrow().log_path.display())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
