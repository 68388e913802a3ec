use std::time::Duration;
use thiserror::Error;

/// Why a suspended operation was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CancelReason {
    #[error("cancelled by caller")]
    Requested,
    #[error("run deadline exceeded")]
    DeadlineExceeded,
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// Timeouts, 5xx, 429 and connection failures.
    #[error("transient fetch failure (status={status:?}): {message}")]
    Transient { status: Option<u16>, message: String },

    /// 4xx other than 429.
    #[error("client error (status={status}): {message}")]
    Client { status: u16, message: String },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("circuit breaker open; retry in {}s", .remaining.as_secs())]
    CircuitOpen { remaining: Duration },

    #[error("fetch interrupted: {0}")]
    Cancelled(CancelReason),

    #[error("giving up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<FetchError>,
    },
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient { .. })
    }

    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        let status = err.status().map(|s| s.as_u16());
        if err.is_decode() {
            return FetchError::Malformed(err.to_string());
        }
        match status {
            Some(code) if (400..500).contains(&code) && code != 429 => FetchError::Client {
                status: code,
                message: err.to_string(),
            },
            _ => FetchError::Transient {
                status,
                message: err.to_string(),
            },
        }
    }

    pub(crate) fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let code = status.as_u16();
        let message = truncate(body, 512);
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            FetchError::Transient {
                status: Some(code),
                message,
            }
        } else {
            FetchError::Client {
                status: code,
                message,
            }
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
