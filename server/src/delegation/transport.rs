//! Outbound Delegation Transport
//!
//! Builds the signed HTTP request for a delegation target and normalizes the
//! two accepted response shapes (bare payload and structured envelope) into
//! one internal form. The gateway and the async workers share this seam; the
//! production implementation rides on `reqwest`, tests script their own.

use std::future::Future;

use serde_json::Value;
use uuid::Uuid;

use super::signing;
use super::types::{DelegationError, DelegationTarget};

/// One delegation attempt as sent over the wire.
#[derive(Debug, Clone)]
pub struct DelegationRequest {
    /// Correlation id, stable across retries of the same job.
    pub request_id: Uuid,
    pub payload: Value,
    /// `(attempt, max_attempts)` for async deliveries; `None` for sync calls.
    pub attempt: Option<(u32, u32)>,
}

impl DelegationRequest {
    /// A synchronous, single-shot request with a fresh correlation id.
    #[must_use]
    pub fn sync(payload: Value) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            payload,
            attempt: None,
        }
    }
}

/// Transport seam for delegated calls.
///
/// Implementations must not enforce their own overall deadline; callers race
/// `invoke` against an explicit timeout.
pub trait Transport: Send + Sync + 'static {
    fn invoke(
        &self,
        target: &DelegationTarget,
        request: &DelegationRequest,
    ) -> impl Future<Output = Result<Value, DelegationError>> + Send;
}

/// Production transport: signed `reqwest` POST to the target endpoint.
#[derive(Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    #[must_use]
    pub const fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Transport for HttpTransport {
    async fn invoke(
        &self,
        target: &DelegationTarget,
        request: &DelegationRequest,
    ) -> Result<Value, DelegationError> {
        let body = serde_json::to_vec(&request.payload)
            .map_err(|e| DelegationError::Transport(format!("payload serialize error: {e}")))?;

        let signature = signing::signature_header(&target.signing_secret, &body);
        let timestamp = chrono::Utc::now().timestamp().to_string();

        let mut req = self
            .client
            .post(&target.endpoint)
            .header("Content-Type", "application/json")
            .header("X-Delegation-Signature", signature)
            .header("X-Delegation-Capability", target.capability.as_str())
            .header("X-Delegation-Request-Id", request.request_id.to_string())
            .header("X-Delegation-Timestamp", &timestamp)
            // Advertise the deadline so endpoints can budget their work
            .header("X-Delegation-Timeout-Ms", target.timeout_ms.to_string());

        if let Some((attempt, max_attempts)) = request.attempt {
            req = req
                .header("X-Delegation-Attempt", attempt.to_string())
                .header("X-Delegation-Max-Attempts", max_attempts.to_string());
        }

        let response = req.body(body).send().await.map_err(|e| {
            if e.is_timeout() {
                DelegationError::Timeout(target.timeout_ms.max(0) as u64)
            } else {
                DelegationError::Transport(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| DelegationError::Transport(e.to_string()))?;

        normalize_response(status, &bytes)
    }
}

/// Normalize an endpoint response into the internal payload form.
///
/// Accepted shapes:
/// - legacy bare payload: any JSON value, returned as-is
/// - structured envelope: `{ "success": bool, "data": … | "error": … }`
pub fn normalize_response(status: u16, body: &[u8]) -> Result<Value, DelegationError> {
    if !(200..300).contains(&status) {
        return Err(DelegationError::Remote(format!("HTTP {status}")));
    }

    let value: Value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(body)
            .map_err(|e| DelegationError::Validation(format!("invalid JSON body: {e}")))?
    };

    // Envelope form is detected by a boolean `success` field
    if let Some(success) = value.get("success").and_then(Value::as_bool) {
        if success {
            return Ok(value.get("data").cloned().unwrap_or(Value::Null));
        }
        let message = value
            .get("error")
            .map_or_else(|| "unspecified error".to_owned(), |e| match e {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });
        return Err(DelegationError::Remote(message));
    }

    Ok(value)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn bare_payload_passes_through() {
        let body = serde_json::to_vec(&json!({"winners": ["a", "b"]})).unwrap();
        let value = normalize_response(200, &body).unwrap();
        assert_eq!(value, json!({"winners": ["a", "b"]}));
    }

    #[test]
    fn envelope_success_unwraps_data() {
        let body = serde_json::to_vec(&json!({"success": true, "data": {"n": 3}})).unwrap();
        let value = normalize_response(200, &body).unwrap();
        assert_eq!(value, json!({"n": 3}));
    }

    #[test]
    fn envelope_failure_is_a_remote_error() {
        let body = serde_json::to_vec(&json!({"success": false, "error": "out of prizes"})).unwrap();
        let err = normalize_response(200, &body).unwrap_err();
        assert!(matches!(err, DelegationError::Remote(msg) if msg == "out of prizes"));
    }

    #[test]
    fn non_success_status_is_a_remote_error() {
        let err = normalize_response(503, b"{}").unwrap_err();
        assert!(matches!(err, DelegationError::Remote(msg) if msg == "HTTP 503"));
    }

    #[test]
    fn malformed_body_is_a_validation_error() {
        let err = normalize_response(200, b"not json").unwrap_err();
        assert!(matches!(err, DelegationError::Validation(_)));
    }

    #[test]
    fn empty_body_normalizes_to_null() {
        assert_eq!(normalize_response(204, b"").unwrap(), Value::Null);
    }

    #[test]
    fn success_field_that_is_not_bool_is_bare_payload() {
        let body = serde_json::to_vec(&json!({"success": "yes"})).unwrap();
        let value = normalize_response(200, &body).unwrap();
        assert_eq!(value, json!({"success": "yes"}));
    }
}
