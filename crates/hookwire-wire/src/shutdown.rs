//! Shutdown signalling shared between a server, its hooks and its owner.

use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Why a server stopped accepting connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The owner called `shutdown()`.
    Requested,
    /// Ctrl-C.
    Interrupted,
    /// A component hit an unrecoverable error.
    Fatal(String),
}

impl ShutdownReason {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ShutdownReason::Fatal(_))
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Requested => write!(f, "shutdown requested"),
            ShutdownReason::Interrupted => write!(f, "interrupted"),
            ShutdownReason::Fatal(reason) => write!(f, "fatal: {reason}"),
        }
    }
}

/// Clonable handle that stops a server from anywhere.
///
/// The first reason wins; later calls to [`fire`](Self::fire) are ignored.
#[derive(Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<Option<ShutdownReason>>>,
    rx: watch::Receiver<Option<ShutdownReason>>,
}

impl ShutdownTrigger {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(None);
        Self { tx: Arc::new(tx), rx }
    }

    /// Request shutdown. Returns `false` if a reason was already recorded.
    pub fn fire(&self, reason: ShutdownReason) -> bool {
        let mut accepted = false;
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            info!(%reason, "Shutdown triggered");
            *current = Some(reason.clone());
            accepted = true;
            true
        });
        accepted
    }

    /// The recorded reason, if shutdown has been requested.
    pub fn reason(&self) -> Option<ShutdownReason> {
        self.rx.borrow().clone()
    }

    pub fn is_fired(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Resolve once shutdown has been requested.
    pub async fn fired(&self) -> ShutdownReason {
        let mut rx = self.rx.clone();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or(ShutdownReason::Requested),
            Err(_) => ShutdownReason::Requested,
        };
        reason
    }
}

impl Default for ShutdownTrigger {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ShutdownTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownTrigger")
            .field("reason", &self.reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_reason_wins() {
        let trigger = ShutdownTrigger::new();
        let observer = trigger.clone();
        assert!(!observer.is_fired());

        let waiter = tokio::spawn(async move { observer.fired().await });
        assert!(trigger.fire(ShutdownReason::Fatal("records unreachable".into())));
        assert!(!trigger.fire(ShutdownReason::Requested));

        let reason = waiter.await.unwrap();
        assert_eq!(reason, ShutdownReason::Fatal("records unreachable".into()));
        assert!(reason.is_fatal());
        assert_eq!(trigger.reason(), Some(reason));
    }

    #[tokio::test]
    async fn test_fired_after_the_fact() {
        let trigger = ShutdownTrigger::new();
        trigger.fire(ShutdownReason::Interrupted);
        assert_eq!(trigger.fired().await, ShutdownReason::Interrupted);
    }
}
