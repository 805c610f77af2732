use thiserror::Error;

/// Failure taxonomy shared by every component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Timeout, dropped connection, 5xx. Retried with backoff.
    TransientTransport,
    /// Out-of-order or too-old data. Discarded, never surfaced.
    StaleState,
    /// Malformed or disallowed request. Surfaced immediately, never retried.
    Rejected,
    /// Missing or expired shared token. One rotation, one retry.
    CredentialInvalid,
}

#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected status: {status} body={body}")]
    Status { status: u16, body: String },
    #[error("credential rejected: {0}")]
    CredentialInvalid(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("stale state: {0}")]
    Stale(String),
    #[error("invalid payload: {0}")]
    Decode(String),
    #[error("channel closed")]
    Closed,
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Timeout
            | SyncError::Transport(_)
            | SyncError::Decode(_)
            | SyncError::Closed => ErrorKind::TransientTransport,
            SyncError::Status { status, .. } => match status {
                408 | 429 => ErrorKind::TransientTransport,
                s if *s >= 500 => ErrorKind::TransientTransport,
                _ => ErrorKind::Rejected,
            },
            SyncError::CredentialInvalid(_) => ErrorKind::CredentialInvalid,
            SyncError::Rejected(_) => ErrorKind::Rejected,
            SyncError::Stale(_) => ErrorKind::StaleState,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::TransientTransport
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::Timeout
        } else if err.is_decode() {
            SyncError::Decode(err.to_string())
        } else {
            SyncError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Decode(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for SyncError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        SyncError::Timeout
    }
}

/// Tagged result for public contracts; expected failures resolve here
/// instead of escaping as errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Ok(T),
    Retrying { attempt: u32, kind: ErrorKind },
    Failed { kind: ErrorKind, detail: String },
}

impl<T> Outcome<T> {
    pub fn failed(err: &SyncError) -> Self {
        Outcome::Failed {
            kind: err.kind(),
            detail: err.to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok(_))
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Outcome::Retrying { .. })
    }

    pub fn failure_kind(&self) -> Option<ErrorKind> {
        match self {
            Outcome::Failed { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn status_codes_map_to_kinds() {
        let server = SyncError::Status {
            status: 503,
            body: String::new(),
        };
        assert_eq!(server.kind(), ErrorKind::TransientTransport);
        assert!(server.is_retryable());

        let client = SyncError::Status {
            status: 422,
            body: "bad order".into(),
        };
        assert_eq!(client.kind(), ErrorKind::Rejected);
        assert!(!client.is_retryable());

        let throttled = SyncError::Status {
            status: 429,
            body: String::new(),
        };
        assert!(throttled.is_retryable());
    }

    #[test_timeout::timeout]
    fn credential_and_stale_are_distinct() {
        assert_eq!(
            SyncError::CredentialInvalid("expired".into()).kind(),
            ErrorKind::CredentialInvalid
        );
        assert_eq!(
            SyncError::Stale("tick 4 < 5".into()).kind(),
            ErrorKind::StaleState
        );
    }

    #[test_timeout::timeout]
    fn outcome_from_error_carries_detail() {
        let outcome: Outcome<()> = Outcome::failed(&SyncError::Rejected("not enough gold".into()));
        assert_eq!(outcome.failure_kind(), Some(ErrorKind::Rejected));
        assert!(outcome.is_terminal());
        match outcome {
            Outcome::Failed { detail, .. } => assert!(detail.contains("not enough gold")),
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
