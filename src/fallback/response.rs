//! Fixed-shape liveness payload served by the fallback listener.

use std::net::IpAddr;

use chrono::{SecondsFormat, Utc};
use serde_json::json;

/// Message every fallback response carries.
pub const FALLBACK_MESSAGE: &str = "Local fallback HTTP server is running";

/// JSON body: message, ISO-8601 timestamp, and the peer's address.
pub fn probe_body(peer: IpAddr) -> String {
    json!({
        "message": FALLBACK_MESSAGE,
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        "clientIP": peer.to_string(),
    })
    .to_string()
}

/// Frame `body` as a minimal HTTP/1.1 200 response.
pub fn http_response(body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_probe_body_fields() {
        let body = probe_body(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["message"], FALLBACK_MESSAGE);
        assert_eq!(value["clientIP"], "127.0.0.1");
        let ts = value["timestamp"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(ts).is_ok());
    }

    #[test]
    fn test_content_length_counts_bytes() {
        // Multi-byte characters must be counted in bytes, not chars.
        let body = r#"{"message":"서버"}"#;
        let response = http_response(body);
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains(&format!("Content-Length: {}\r\n", body.len())));
        assert!(response.ends_with(body));
    }
}
