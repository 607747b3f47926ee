use std::future::Future;
use std::sync::Arc;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

/// One-way, single-fire termination signal. Once triggered it stays triggered.
#[derive(Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Returns `true` for the call that actually fired the signal.
    pub fn trigger(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Spawns the task that turns the signal into listener shutdown.
///
/// The returned future completes once the signal has fired and is meant for
/// `with_graceful_shutdown`; the handle should be awaited after the server
/// returns.
pub fn spawn_watcher(
    signal: ShutdownSignal,
) -> (JoinHandle<()>, impl Future<Output = ()> + Send + 'static) {
    let (close_tx, close_rx) = oneshot::channel::<()>();
    let watcher = tokio::spawn(async move {
        signal.wait().await;
        tracing::info!("Shutting down server...");
        let _ = close_tx.send(());
    });
    let closed = async move {
        let _ = close_rx.await;
    };
    (watcher, closed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn trigger_fires_once() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_triggered());
        assert!(signal.trigger());
        assert!(!signal.trigger());
        assert!(signal.is_triggered());
        signal.wait().await;
    }

    #[tokio::test]
    async fn watcher_completes_after_trigger() {
        let signal = ShutdownSignal::new();
        let (watcher, closed) = spawn_watcher(signal.clone());
        tokio::pin!(closed);

        assert!(
            tokio::time::timeout(Duration::from_millis(50), &mut closed)
                .await
                .is_err()
        );
        signal.trigger();
        tokio::time::timeout(Duration::from_secs(5), closed)
            .await
            .expect("listener close future");
        watcher.await.unwrap();
    }
}
