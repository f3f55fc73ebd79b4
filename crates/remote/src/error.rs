use std::time::Duration;

/// Errors reported by a `LedgerApi` implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// Connection refused, reset, timed out...
    #[error("transport error: {0}")]
    Transport(String),

    /// The endpoint answered "too many requests".
    #[error("remote throttled the request")]
    Throttled,

    /// Throttling persisted through every retry.
    #[error("remote still throttling after {retries} retries")]
    ThrottleExhausted { retries: u32 },

    #[error("remote server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("authentication failed: {0}")]
    Auth(String),

    /// The remote application rejected the operation (validation, access...).
    #[error("remote fault: {0}")]
    Fault(String),

    #[error("remote record not found: {0}")]
    NotFound(String),

    /// The response could not be understood.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl RemoteError {
    pub fn is_throttled(&self) -> bool {
        matches!(self, RemoteError::Throttled)
    }

    /// Whether the failure says something about the health of the endpoint.
    ///
    /// Only these feed the circuit breaker. An application fault means the
    /// endpoint is up and answering.
    pub fn is_endpoint_failure(&self) -> bool {
        matches!(
            self,
            RemoteError::Transport(_)
                | RemoteError::Throttled
                | RemoteError::ThrottleExhausted { .. }
                | RemoteError::Server { .. }
                | RemoteError::Protocol(_)
        )
    }
}

/// Outcome of a guarded remote call that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuardedError {
    /// The call was rejected without reaching the remote side.
    #[error("circuit open, retry in {}s", retry_in.as_secs())]
    CircuitOpen { retry_in: Duration },

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl GuardedError {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, GuardedError::CircuitOpen { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn faults_do_not_count_against_the_endpoint() {
        assert!(!RemoteError::Fault("constraint".into()).is_endpoint_failure());
        assert!(!RemoteError::Auth("bad password".into()).is_endpoint_failure());
        assert!(!RemoteError::NotFound("journal 3".into()).is_endpoint_failure());
        assert!(RemoteError::Transport("reset".into()).is_endpoint_failure());
        assert!(
            RemoteError::Server {
                status: 502,
                message: "bad gateway".into()
            }
            .is_endpoint_failure()
        );
    }

    #[test]
    fn circuit_open_message_reports_seconds() {
        let err = GuardedError::CircuitOpen {
            retry_in: Duration::from_secs(42),
        };
        assert_eq!(err.to_string(), "circuit open, retry in 42s");
        assert!(err.is_circuit_open());
    }
}
