//! Session cancellation.

use tokio::sync::watch;

/// A cloneable cancellation signal shared by the tasks of one discovery session.
///
/// Cancelling stops probing and ticking; it does not abort requests already in
/// flight, those finish or time out on their own.
#[derive(Debug, Clone)]
pub struct Cancellation {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl Cancellation {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Cancellation {
            tx: std::sync::Arc::new(tx),
        }
    }

    /// Create a token that cancels itself after `timeout`.
    pub fn with_timeout(timeout: std::time::Duration) -> Self {
        let token = Cancellation::new();
        let timer = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => timer.cancel(),
                _ = timer.cancelled() => {}
            }
        });
        token
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so `wait_for` only ends on cancellation.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Cancellation::new()
    }
}
