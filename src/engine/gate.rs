use tokio::sync::watch;

/// One-shot startup latch.
///
/// Confirmation and waiting tasks wait on it so they do not drain their
/// queues before persisted records are reloaded.
#[derive(Debug)]
pub struct StartupGate {
    tx: watch::Sender<bool>,
}

impl Default for StartupGate {
    fn default() -> Self {
        Self::new()
    }
}

impl StartupGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn open(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // Only fails if the sender is dropped, and `self` owns it
        let _ = rx.wait_for(|open| *open).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_released_by_open() {
        let gate = Arc::new(StartupGate::new());
        assert!(!gate.is_open());

        let waiter = Arc::clone(&gate);
        let handle = tokio::spawn(async move { waiter.wait().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());

        gate.open();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(gate.is_open());
    }

    #[test]
    fn test_wait_pending_until_open() {
        let gate = StartupGate::new();
        let mut wait = tokio_test::task::spawn(gate.wait());
        tokio_test::assert_pending!(wait.poll());

        gate.open();
        assert!(wait.is_woken());
        tokio_test::assert_ready!(wait.poll());
    }

    #[tokio::test]
    async fn test_wait_after_open_returns() {
        let gate = StartupGate::new();
        gate.open();
        gate.wait().await;
    }
}
