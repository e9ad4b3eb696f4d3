use std::sync::Arc;

use tokio::sync::watch;

/// One-shot latch fired when a session registers.
///
/// Clones share the same latch. Any number of tasks may notify; only the
/// first call flips it. Every waiter observes the event, including waiters
/// that subscribe afterwards.
#[derive(Debug, Clone)]
pub struct ConnectedSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl ConnectedSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the latch. Returns true for the call that actually fired it.
    pub fn notify(&self) -> bool {
        self.tx.send_if_modified(|fired| {
            if *fired {
                false
            } else {
                *fired = true;
                true
            }
        })
    }

    pub fn is_notified(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so this cannot fail
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

impl Default for ConnectedSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve once a graceful shutdown has been requested.
///
/// Never resolves if the sender is gone without requesting one.
pub async fn graceful_shutdown(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|requested| *requested).await.is_err() {
        std::future::pending::<()>().await;
    }
}
