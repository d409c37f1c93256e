//! Fallback listener: a minimal in-process HTTP liveness responder.
//!
//! Used when the sidecar path is unavailable or distrusted. Every accepted
//! connection gets the same JSON payload regardless of what was sent; there
//! is no request parsing. One task per connection is fine for probe traffic.

pub mod response;

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Upper bound on how long `stop()` waits for the accept loop to exit.
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a handler waits for request bytes before answering anyway.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Errors and status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindError {
    PortInUse { port: u16 },
    PermissionDenied { port: u16 },
    Io { port: u16, detail: String },
}

impl BindError {
    fn from_io(port: u16, err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::AddrInUse => Self::PortInUse { port },
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { port },
            _ => Self::Io {
                port,
                detail: err.to_string(),
            },
        }
    }
}

impl fmt::Display for BindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PortInUse { port } => write!(f, "port {} is already in use", port),
            Self::PermissionDenied { port } => write!(f, "permission denied binding port {}", port),
            Self::Io { port, detail } => write!(f, "failed to bind port {}: {}", port, detail),
        }
    }
}

impl std::error::Error for BindError {}

/// Pushed to the status callback on every listener state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ListenerStatus {
    Started { port: u16 },
    AlreadyRunning { port: u16 },
    ClientAccepted { peer: String },
    ClientServed { peer: String },
    ClientFailed { peer: String, reason: String },
    Stopped,
    BindFailed { port: u16, reason: String },
}

impl fmt::Display for ListenerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started { port } => write!(f, "Fallback server running on port {}", port),
            Self::AlreadyRunning { port } => {
                write!(f, "Fallback server is already running on port {}", port)
            }
            Self::ClientAccepted { peer } => write!(f, "Accepted connection from {}", peer),
            Self::ClientServed { peer } => write!(f, "Served probe from {}", peer),
            Self::ClientFailed { peer, reason } => {
                write!(f, "Connection from {} failed: {}", peer, reason)
            }
            Self::Stopped => write!(f, "Fallback server stopped"),
            Self::BindFailed { port, reason } => {
                write!(f, "Fallback server failed to start on port {}: {}", port, reason)
            }
        }
    }
}

/// Push-style status notification channel.
pub type StatusCallback = Arc<dyn Fn(ListenerStatus) + Send + Sync>;

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

struct RunningServer {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct FallbackListener {
    callback: StatusCallback,
    server: Mutex<Option<RunningServer>>,
    running: Arc<AtomicBool>,
    bound_port: Arc<AtomicU16>,
    connections: Arc<AtomicUsize>,
}

impl FallbackListener {
    pub fn new(callback: StatusCallback) -> Self {
        Self {
            callback,
            server: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            bound_port: Arc::new(AtomicU16::new(0)),
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Bind `0.0.0.0:port` and start the accept loop.
    ///
    /// A second call while running is a no-op that only notifies
    /// `AlreadyRunning`. Bind failures surface here and are also notified.
    pub async fn start(&self, port: u16) -> Result<(), BindError> {
        let mut server = self.server.lock().await;
        if server.is_some() && self.running.load(Ordering::Acquire) {
            let port = self.bound_port.load(Ordering::Acquire);
            debug!(port, "Fallback listener already running");
            (self.callback)(ListenerStatus::AlreadyRunning { port });
            return Ok(());
        }

        let listener = match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener,
            Err(e) => {
                let err = BindError::from_io(port, &e);
                warn!("Fallback listener bind failed: {}", err);
                (self.callback)(ListenerStatus::BindFailed {
                    port,
                    reason: err.to_string(),
                });
                return Err(err);
            }
        };
        let actual_port = listener
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(port);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.running.store(true, Ordering::Release);
        self.bound_port.store(actual_port, Ordering::Release);

        let task = tokio::spawn(accept_loop(
            listener,
            shutdown_rx,
            Arc::clone(&self.callback),
            Arc::clone(&self.connections),
            Arc::clone(&self.running),
        ));
        *server = Some(RunningServer { shutdown_tx, task });

        info!(port = actual_port, "Fallback listener started");
        (self.callback)(ListenerStatus::Started { port: actual_port });
        Ok(())
    }

    /// Close the listening socket and wait (bounded) for the accept loop.
    ///
    /// In-flight connection handlers finish on their own.
    pub async fn stop(&self) {
        let Some(server) = self.server.lock().await.take() else {
            debug!("Fallback listener stop requested while not running");
            return;
        };

        let _ = server.shutdown_tx.send(true);
        let mut task = server.task;
        if tokio::time::timeout(STOP_TIMEOUT, &mut task).await.is_err() {
            warn!("Accept loop did not exit within {:?}; aborting", STOP_TIMEOUT);
            task.abort();
        }

        self.running.store(false, Ordering::Release);
        self.bound_port.store(0, Ordering::Release);
        info!("Fallback listener stopped");
        (self.callback)(ListenerStatus::Stopped);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Port actually bound (useful when started on port 0), or `None`.
    pub fn local_port(&self) -> Option<u16> {
        match self.bound_port.load(Ordering::Acquire) {
            0 => None,
            port => Some(port),
        }
    }

    /// Connections currently being answered.
    pub fn active_connections(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }
}

async fn accept_loop(
    listener: TcpListener,
    mut shutdown_rx: watch::Receiver<bool>,
    callback: StatusCallback,
    connections: Arc<AtomicUsize>,
    running: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            // Fires on stop() and also if the sender is dropped.
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "Fallback listener accepted connection");
                    tokio::spawn(handle_connection(
                        stream,
                        peer,
                        Arc::clone(&callback),
                        Arc::clone(&connections),
                    ));
                }
                Err(e) => {
                    // Transient (e.g. fd exhaustion): keep serving.
                    warn!("Fallback accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }

    drop(listener);
    running.store(false, Ordering::Release);
    debug!("Fallback accept loop exited");
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    callback: StatusCallback,
    connections: Arc<AtomicUsize>,
) {
    connections.fetch_add(1, Ordering::AcqRel);
    callback(ListenerStatus::ClientAccepted {
        peer: peer.ip().to_string(),
    });
    let result = respond(&mut stream, peer.ip()).await;

    match result {
        Ok(()) => {
            info!(%peer, "Fallback probe served");
            callback(ListenerStatus::ClientServed {
                peer: peer.ip().to_string(),
            });
        }
        Err(e) => {
            warn!(%peer, "Fallback connection error: {}", e);
            callback(ListenerStatus::ClientFailed {
                peer: peer.ip().to_string(),
                reason: e.to_string(),
            });
        }
    }
    connections.fetch_sub(1, Ordering::AcqRel);
}

async fn respond(stream: &mut TcpStream, peer: IpAddr) -> std::io::Result<()> {
    // Take whatever the client already sent so closing doesn't reset the
    // connection; the bytes themselves are ignored.
    let mut buf = [0u8; 1024];
    let _ = tokio::time::timeout(DRAIN_TIMEOUT, stream.read(&mut buf)).await;

    let body = response::probe_body(peer);
    stream
        .write_all(response::http_response(&body).as_bytes())
        .await?;
    stream.flush().await?;
    stream.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Instant;

    fn recording_callback() -> (StatusCallback, Arc<StdMutex<Vec<ListenerStatus>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: StatusCallback = Arc::new(move |status| sink.lock().unwrap().push(status));
        (callback, seen)
    }

    async fn probe(port: u16) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut raw = String::new();
        stream.read_to_string(&mut raw).await.unwrap();
        raw
    }

    #[tokio::test]
    async fn test_serves_probe_payload() {
        let (callback, seen) = recording_callback();
        let listener = FallbackListener::new(callback);
        listener.start(0).await.unwrap();
        let port = listener.local_port().unwrap();

        let raw = probe(port).await;
        assert!(raw.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(raw.contains("Content-Type: application/json\r\n"));

        let body = raw.split("\r\n\r\n").nth(1).unwrap();
        let value: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(value["clientIP"], "127.0.0.1");
        assert!(chrono::DateTime::parse_from_rfc3339(value["timestamp"].as_str().unwrap()).is_ok());

        // The handler finishes after the client sees EOF.
        let deadline = Instant::now() + Duration::from_secs(1);
        while listener.active_connections() > 0 {
            assert!(Instant::now() < deadline, "connection count never drained");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        listener.stop().await;
        let seen = seen.lock().unwrap();
        assert!(matches!(seen[0], ListenerStatus::Started { .. }));
        let accepted = seen
            .iter()
            .position(|s| *s == ListenerStatus::ClientAccepted { peer: "127.0.0.1".into() })
            .unwrap();
        let served = seen
            .iter()
            .position(|s| *s == ListenerStatus::ClientServed { peer: "127.0.0.1".into() })
            .unwrap();
        assert!(accepted < served);
        assert_eq!(seen.last(), Some(&ListenerStatus::Stopped));
    }

    #[tokio::test]
    async fn test_silent_client_still_answered() {
        let (callback, _seen) = recording_callback();
        let listener = FallbackListener::new(callback);
        listener.start(0).await.unwrap();
        let port = listener.local_port().unwrap();

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut raw = String::new();
        stream.read_to_string(&mut raw).await.unwrap();
        assert!(raw.starts_with("HTTP/1.1 200 OK"));

        listener.stop().await;
    }

    #[tokio::test]
    async fn test_second_start_is_noop() {
        let (callback, seen) = recording_callback();
        let listener = FallbackListener::new(callback);
        listener.start(0).await.unwrap();
        let port = listener.local_port().unwrap();

        listener.start(0).await.unwrap();
        assert_eq!(listener.local_port(), Some(port));
        assert!(seen
            .lock()
            .unwrap()
            .contains(&ListenerStatus::AlreadyRunning { port }));

        listener.stop().await;
    }

    #[tokio::test]
    async fn test_port_in_use() {
        let occupied = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let port = occupied.local_addr().unwrap().port();

        let (callback, seen) = recording_callback();
        let listener = FallbackListener::new(callback);
        assert_eq!(listener.start(port).await, Err(BindError::PortInUse { port }));
        assert!(!listener.is_running());
        assert!(matches!(
            seen.lock().unwrap()[0],
            ListenerStatus::BindFailed { .. }
        ));
    }

    #[tokio::test]
    async fn test_stop_unblocks_idle_accept_loop() {
        let (callback, _seen) = recording_callback();
        let listener = FallbackListener::new(callback);
        listener.start(0).await.unwrap();
        let port = listener.local_port().unwrap();
        assert!(listener.is_running());

        let started = Instant::now();
        listener.stop().await;
        assert!(started.elapsed() < STOP_TIMEOUT);
        assert!(!listener.is_running());
        assert_eq!(listener.local_port(), None);

        // The socket is really closed: the port can be bound again.
        let rebound = TcpListener::bind(("0.0.0.0", port)).await;
        assert!(rebound.is_ok());
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let (callback, _seen) = recording_callback();
        let listener = FallbackListener::new(callback);
        listener.start(0).await.unwrap();
        listener.stop().await;
        listener.start(0).await.unwrap();
        assert!(listener.is_running());
        listener.stop().await;
    }
}
