//! Error taxonomy surfaced to callers of the RPC client.

use crate::protocol::EncryptionProtocol;
use std::fmt;
use thiserror::Error;

/// Which half of a request was in progress when a timeout fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Sending,
    Receiving,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Sending => write!(f, "sending"),
            Phase::Receiving => write!(f, "receiving reply"),
        }
    }
}

/// Everything a remote call can end in, other than a success payload.
#[derive(Error, Debug)]
pub enum RpcError {
    /// The server could not be reached (refused, reset, connect timeout).
    #[error("could not reach {addr}: {source}")]
    Connection {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The send or receive deadline elapsed.
    #[error("RPC request timed out while {phase}")]
    Timeout { phase: Phase },

    /// The server has no procedure under the requested name.
    #[error("RPC target '{0}()' either doesn't exist, or isn't hooked")]
    InvalidHook(String),

    /// The procedure ran and failed.
    #[error("remote procedure raised an error:\n{}", indent(.0))]
    Procedure(String),

    /// Protocol violation, replay, or internal fault.
    ///
    /// `hook_processed` is `None` when the client detected the violation
    /// itself and cannot know whether the hook ran.
    #[error("critical RPC error ({}): {detail}", processed_text(.hook_processed))]
    Critical {
        hook_processed: Option<bool>,
        detail: String,
    },

    /// A confidential call was refused because no encryption was negotiated.
    #[error("encryption protocol {0} is unavailable; refusing to send a confidential call in the clear")]
    EncryptionUnavailable(EncryptionProtocol),

    /// The success payload did not have the shape the caller asked for.
    #[error("unexpected response payload: {0}")]
    UnexpectedPayload(String),

    /// A retrying caller gave up.
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<RpcError> },
}

impl RpcError {
    /// Whether a retry of the full connect→handshake→call sequence is safe.
    ///
    /// Only failures known to precede the hook qualify. Receive timeouts and
    /// critical errors not confirmed as unprocessed are excluded: the call may
    /// already have changed state on the server.
    pub fn is_retryable(&self) -> bool {
        match self {
            RpcError::Connection { .. } => true,
            RpcError::Timeout { phase } => *phase == Phase::Sending,
            RpcError::Critical { hook_processed, .. } => *hook_processed == Some(false),
            _ => false,
        }
    }

    /// Shorthand for a violation detected on the client side.
    pub fn violation(detail: impl Into<String>) -> Self {
        RpcError::Critical {
            hook_processed: None,
            detail: detail.into(),
        }
    }
}

fn processed_text(hook_processed: &Option<bool>) -> &'static str {
    match hook_processed {
        Some(true) => "the request was processed",
        Some(false) => "the request was not processed",
        None => "unknown whether the request was processed",
    }
}

fn indent(trace: &str) -> String {
    trace
        .trim()
        .lines()
        .map(|line| format!("|    {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Alias for results of remote calls.
pub type RpcResult<T> = Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let refused = RpcError::Connection {
            addr: "127.0.0.1:1".into(),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        };
        assert!(refused.is_retryable());
        assert!(RpcError::Timeout { phase: Phase::Sending }.is_retryable());
        assert!(!RpcError::Timeout { phase: Phase::Receiving }.is_retryable());
        assert!(RpcError::Critical { hook_processed: Some(false), detail: String::new() }.is_retryable());
        assert!(!RpcError::Critical { hook_processed: Some(true), detail: String::new() }.is_retryable());
        // A reply lost after the request went out may follow a completed call.
        assert!(!RpcError::violation("connection closed").is_retryable());
        assert!(!RpcError::InvalidHook("x".into()).is_retryable());
        assert!(!RpcError::Procedure("boom".into()).is_retryable());
    }

    #[test]
    fn test_messages() {
        let e = RpcError::InvalidHook("nonexistent".into());
        assert_eq!(
            e.to_string(),
            "RPC target 'nonexistent()' either doesn't exist, or isn't hooked"
        );
        let e = RpcError::Timeout { phase: Phase::Receiving };
        assert_eq!(e.to_string(), "RPC request timed out while receiving reply");
        let e = RpcError::Procedure("line one\nline two".into());
        assert!(e.to_string().contains("|    line two"));
        let e = RpcError::Critical { hook_processed: Some(false), detail: "replay".into() };
        assert!(e.to_string().contains("was not processed"));
    }
}
