// Protocol version negotiation.
//
// Clients may name the protocol they speak in the `protocol` query parameter
// of the WebSocket upgrade (e.g. "huddle-rt.v1"). Unsupported versions are
// refused with UPGRADE_REQUIRED before the socket is accepted. Omitting the
// parameter means the current version.

use huddle_common::protocol::ws::{CURRENT_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS};
use serde_json::json;

use crate::error::{ErrorCode, RelayError};

/// Returns true if the given protocol version string is supported.
pub fn is_supported(version: &str) -> bool {
    SUPPORTED_PROTOCOL_VERSIONS.contains(&version)
}

/// Supported protocol versions, newest first.
pub fn supported_versions() -> &'static [&'static str] {
    SUPPORTED_PROTOCOL_VERSIONS
}

/// Validates a client-supplied protocol version.
pub fn require_supported(version: &str) -> Result<(), RelayError> {
    if is_supported(version) {
        Ok(())
    } else {
        Err(RelayError::new(
            ErrorCode::UpgradeRequired,
            format!("unsupported protocol version: {version}"),
        )
        .with_details(json!({
            "requested_version": version,
            "supported_versions": SUPPORTED_PROTOCOL_VERSIONS,
            "current_version": CURRENT_PROTOCOL_VERSION,
        })))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn current_version_is_supported() {
        assert!(is_supported(CURRENT_PROTOCOL_VERSION));
        assert!(require_supported(CURRENT_PROTOCOL_VERSION).is_ok());
    }

    #[test]
    fn unknown_versions_are_not_supported() {
        assert!(!is_supported("huddle-rt.v99"));
        assert!(!is_supported(""));
        // Exact match only.
        assert!(!is_supported("huddle-rt.v1-beta"));
        assert!(!is_supported("huddle-rt.v"));
    }

    #[tokio::test]
    async fn upgrade_required_error_lists_supported_versions() {
        let err = require_supported("huddle-rt.v99").unwrap_err();
        let response = axum::response::IntoResponse::into_response(err);
        assert_eq!(response.status(), axum::http::StatusCode::UPGRADE_REQUIRED);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should be readable");
        let parsed: serde_json::Value =
            serde_json::from_slice(&body).expect("body should be valid json");

        assert_eq!(parsed["error"]["code"], "UPGRADE_REQUIRED");
        assert_eq!(parsed["error"]["retryable"], false);
        assert_eq!(parsed["error"]["details"]["requested_version"], "huddle-rt.v99");
        assert_eq!(parsed["error"]["details"]["current_version"], CURRENT_PROTOCOL_VERSION);
        let supported = parsed["error"]["details"]["supported_versions"]
            .as_array()
            .expect("supported_versions should be an array");
        assert!(supported.iter().any(|v| v == CURRENT_PROTOCOL_VERSION));
    }

    #[test]
    fn supported_versions_are_unique_and_current_first() {
        let versions = supported_versions();
        assert_eq!(versions[0], CURRENT_PROTOCOL_VERSION);

        let mut seen = HashSet::new();
        for version in versions {
            assert!(seen.insert(*version), "duplicate supported version entry: {version}");
        }
    }
}
