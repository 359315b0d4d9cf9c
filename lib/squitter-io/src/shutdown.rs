//! Cooperative shutdown.

use std::time::Duration;

use tokio::sync::watch;

/// A shutdown signal shared by every task that must stop when the process stops.
///
/// Cloning the signal is cheap, and all clones observe the same trigger.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

/// A handle to trigger shutdown.
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownSignal {
    /// Creates a new `ShutdownSignal` and `ShutdownHandle` pair.
    ///
    /// When `ShutdownHandle` is triggered, or dropped, the signal (and all of its clones) is considered triggered.
    pub fn paired() -> (Self, ShutdownHandle) {
        let (tx, rx) = watch::channel(false);
        (Self { rx }, ShutdownHandle { tx })
    }

    /// Returns `true` if shutdown has been triggered.
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Waits until shutdown is triggered.
    ///
    /// Returns immediately if shutdown was already triggered.
    pub async fn wait(&mut self) {
        // An error means the handle was dropped, which counts as a trigger.
        let _ = self.rx.wait_for(|triggered| *triggered).await;
    }

    /// Sleeps for the given duration, waking early if shutdown is triggered.
    ///
    /// Returns `true` if the sleep was cut short by shutdown.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        if self.is_triggered() {
            return true;
        }

        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.wait() => true,
        }
    }
}

impl ShutdownHandle {
    /// Triggers shutdown.
    pub fn trigger(self) {
        self.tx.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sleep_completes_without_trigger() {
        let (mut signal, _handle) = ShutdownSignal::paired();
        assert!(!signal.sleep(Duration::from_secs(5)).await);
        assert!(!signal.is_triggered());
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_interrupts_sleep() {
        let (mut signal, handle) = ShutdownSignal::paired();
        let mut waiter = signal.clone();

        let sleeper = tokio::spawn(async move { waiter.sleep(Duration::from_secs(3600)).await });
        tokio::task::yield_now().await;
        handle.trigger();

        assert!(sleeper.await.unwrap());
        assert!(signal.is_triggered());
        signal.wait().await;
    }

    #[tokio::test]
    async fn dropped_handle_counts_as_trigger() {
        let (mut signal, handle) = ShutdownSignal::paired();
        drop(handle);

        assert!(signal.is_triggered());
        assert!(signal.sleep(Duration::from_secs(3600)).await);
    }
}
