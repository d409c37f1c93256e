//! Downstream protocol client collaborator.
//!
//! The chat/tooling client that talks to the local endpoint is opaque here;
//! the coordinator only asks it to connect to a port and relays the result.

use std::fmt;
use std::time::Duration;

use tracing::info;

use super::readiness::BoxFuture;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectivityError {
    /// Nothing answered on the port.
    Unreachable { port: u16, detail: String },
    /// Something answered, but not with a success status.
    Rejected { port: u16, status: u16 },
}

impl fmt::Display for ConnectivityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unreachable { port, detail } => {
                write!(f, "local endpoint on port {} unreachable: {}", port, detail)
            }
            Self::Rejected { port, status } => {
                write!(f, "local endpoint on port {} answered HTTP {}", port, status)
            }
        }
    }
}

impl std::error::Error for ConnectivityError {}

/// Client that consumes the local HTTP endpoint (dyn-compatible).
pub trait ProtocolClient: Send + Sync {
    /// Connect to the local endpoint at `port`.
    fn connect(&self, port: u16) -> BoxFuture<'_, Result<(), ConnectivityError>>;

    /// Display name used in logs.
    fn name(&self) -> String;
}

/// Default client: a GET against the endpoint root counts as connected.
#[derive(Debug, Clone)]
pub struct HttpProtocolClient {
    client: reqwest::Client,
}

impl HttpProtocolClient {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl ProtocolClient for HttpProtocolClient {
    fn connect(&self, port: u16) -> BoxFuture<'_, Result<(), ConnectivityError>> {
        Box::pin(async move {
            let url = format!("http://127.0.0.1:{}/", port);
            let resp = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| ConnectivityError::Unreachable {
                    port,
                    detail: e.to_string(),
                })?;

            if !resp.status().is_success() {
                return Err(ConnectivityError::Rejected {
                    port,
                    status: resp.status().as_u16(),
                });
            }
            info!(%url, "Protocol client connected");
            Ok(())
        })
    }

    fn name(&self) -> String {
        "http".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallback::FallbackListener;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_connects_to_live_endpoint() {
        let listener = FallbackListener::new(Arc::new(|_| {}));
        listener.start(0).await.unwrap();
        let port = listener.local_port().unwrap();

        let client = HttpProtocolClient::new(Duration::from_secs(2));
        assert_eq!(client.connect(port).await, Ok(()));

        listener.stop().await;
    }

    #[tokio::test]
    async fn test_unreachable_endpoint() {
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let client = HttpProtocolClient::new(Duration::from_millis(500));
        assert!(matches!(
            client.connect(port).await,
            Err(ConnectivityError::Unreachable { .. })
        ));
    }
}
