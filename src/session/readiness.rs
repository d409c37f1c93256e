//! Readiness checks and the connectivity self-test.
//!
//! The bridge cannot tell us when the sidecar's listener is accepting, so
//! readiness is decided by probing the HTTP surface: a settle interval,
//! then bounded polling with exponential backoff.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

/// Boxed future used by the dyn-compatible collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Cap for the exponential backoff between readiness probes.
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Decides when a freshly launched transport can take connections.
pub trait ReadinessCheck: Send + Sync {
    /// Resolve once the endpoint on `port` is ready, or with the reason it
    /// never became ready.
    fn wait_ready(&self, port: u16) -> BoxFuture<'_, Result<(), String>>;

    /// Display name used in logs.
    fn name(&self) -> String;
}

/// Waits a fixed interval and assumes the sidecar is up.
#[derive(Debug, Clone)]
pub struct SettleDelay {
    pub interval: Duration,
}

impl ReadinessCheck for SettleDelay {
    fn wait_ready(&self, _port: u16) -> BoxFuture<'_, Result<(), String>> {
        Box::pin(async move {
            tokio::time::sleep(self.interval).await;
            Ok(())
        })
    }

    fn name(&self) -> String {
        format!("settle delay ({:?})", self.interval)
    }
}

/// Settle interval, then poll `http://127.0.0.1:<port>/` until a 2xx.
#[derive(Debug, Clone)]
pub struct HttpReadiness {
    client: reqwest::Client,
    settle: Duration,
    attempts: u32,
    backoff: Duration,
}

impl HttpReadiness {
    pub fn new(settle: Duration, attempts: u32, backoff: Duration, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()
            .unwrap_or_default();
        Self {
            client,
            settle,
            attempts: attempts.max(1),
            backoff,
        }
    }
}

impl ReadinessCheck for HttpReadiness {
    fn wait_ready(&self, port: u16) -> BoxFuture<'_, Result<(), String>> {
        Box::pin(async move {
            tokio::time::sleep(self.settle).await;

            let url = format!("http://127.0.0.1:{}/", port);
            let mut delay = self.backoff;
            let mut last_error = String::from("no attempt made");

            for attempt in 1..=self.attempts {
                match self.client.get(&url).send().await {
                    Ok(resp) if resp.status().is_success() => {
                        info!(attempt, %url, "Endpoint ready");
                        return Ok(());
                    }
                    Ok(resp) => last_error = format!("HTTP {}", resp.status()),
                    Err(e) => last_error = e.to_string(),
                }
                debug!(attempt, %url, error = %last_error, "Readiness probe failed");

                if attempt < self.attempts {
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(MAX_BACKOFF);
                }
            }

            warn!(%url, attempts = self.attempts, "Endpoint never became ready: {}", last_error);
            Err(format!(
                "no response from {} after {} attempts ({})",
                url, self.attempts, last_error
            ))
        })
    }

    fn name(&self) -> String {
        format!("http probe ({} attempts)", self.attempts)
    }
}

// ---------------------------------------------------------------------------
// Connectivity self-test
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeAttempt {
    pub url: String,
    pub ok: bool,
    pub detail: String,
}

/// Result of trying each candidate URL in order until one answers 200.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeReport {
    /// URL that answered, if any.
    pub url: Option<String>,
    /// Body of the successful response.
    pub body: Option<String>,
    pub attempts: Vec<ProbeAttempt>,
}

impl ProbeReport {
    pub fn succeeded(&self) -> bool {
        self.url.is_some()
    }
}

/// Try each URL with a GET; stop at the first 200.
pub async fn probe_endpoints(urls: &[String], timeout: Duration) -> ProbeReport {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .no_proxy()
        .build()
        .unwrap_or_default();

    let mut report = ProbeReport {
        url: None,
        body: None,
        attempts: Vec::new(),
    };

    for url in urls {
        debug!(%url, "Probing endpoint");
        let outcome = match client.get(url).send().await {
            Ok(resp) if resp.status() == reqwest::StatusCode::OK => {
                resp.text().await.map_err(|e| e.to_string())
            }
            Ok(resp) => Err(format!("HTTP {}", resp.status())),
            Err(e) => Err(e.to_string()),
        };

        match outcome {
            Ok(body) => {
                info!(%url, "Endpoint probe succeeded");
                report.attempts.push(ProbeAttempt {
                    url: url.clone(),
                    ok: true,
                    detail: "200 OK".to_string(),
                });
                report.url = Some(url.clone());
                report.body = Some(body);
                break;
            }
            Err(detail) => {
                warn!(%url, "Endpoint probe failed: {}", detail);
                report.attempts.push(ProbeAttempt {
                    url: url.clone(),
                    ok: false,
                    detail,
                });
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallback::FallbackListener;
    use std::sync::Arc;

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_settle_delay_waits() {
        let check = SettleDelay {
            interval: Duration::from_millis(30),
        };
        let started = std::time::Instant::now();
        check.wait_ready(3000).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_http_readiness_against_live_listener() {
        let listener = FallbackListener::new(Arc::new(|_| {}));
        listener.start(0).await.unwrap();
        let port = listener.local_port().unwrap();

        let check = HttpReadiness::new(
            Duration::ZERO,
            3,
            Duration::from_millis(10),
            Duration::from_secs(2),
        );
        assert!(check.wait_ready(port).await.is_ok());

        listener.stop().await;
    }

    #[tokio::test]
    async fn test_http_readiness_gives_up() {
        let port = free_port();
        let check = HttpReadiness::new(
            Duration::ZERO,
            2,
            Duration::from_millis(10),
            Duration::from_millis(200),
        );
        let err = check.wait_ready(port).await.unwrap_err();
        assert!(err.contains("after 2 attempts"));
    }

    #[tokio::test]
    async fn test_probe_endpoints_stops_at_first_success() {
        let listener = FallbackListener::new(Arc::new(|_| {}));
        listener.start(0).await.unwrap();
        let port = listener.local_port().unwrap();

        let dead = format!("http://127.0.0.1:{}", free_port());
        let live = format!("http://127.0.0.1:{}", port);
        let urls = vec![dead.clone(), live.clone(), "http://127.0.0.1:1".to_string()];

        let report = probe_endpoints(&urls, Duration::from_secs(2)).await;
        assert!(report.succeeded());
        assert_eq!(report.url.as_deref(), Some(live.as_str()));
        assert_eq!(report.attempts.len(), 2);
        assert!(!report.attempts[0].ok);
        assert!(report.body.unwrap().contains("clientIP"));

        listener.stop().await;
    }
}
