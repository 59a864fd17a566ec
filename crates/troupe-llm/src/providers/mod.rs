pub mod ollama;
pub mod openai;

use troupe_core::error::BackendError;

/// Classify a non-success HTTP status into a retryable or final error.
pub(crate) fn classify_status(status: reqwest::StatusCode, body: &str) -> BackendError {
    let message = format!("HTTP {}: {}", status, body);
    if status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error() {
        BackendError::Transient(message)
    } else {
        BackendError::Fatal(message)
    }
}

/// Classify a transport-level failure from reqwest.
pub(crate) fn classify_transport(e: reqwest::Error) -> BackendError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        BackendError::Transient(e.to_string())
    } else {
        BackendError::Fatal(e.to_string())
    }
}
