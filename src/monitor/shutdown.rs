use std::time::Duration;

use tokio::sync::watch;

/// Owner side of the shutdown signal. Dropping it counts as a shutdown.
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

/// Cloneable view of the shutdown signal handed to every loop.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

pub fn shutdown_channel() -> (ShutdownHandle, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, Shutdown { rx })
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }
}

impl Shutdown {
    /// Non-blocking check, for loops that cannot await.
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    pub async fn triggered(&mut self) {
        // An error means the handle is gone, which is a shutdown as well.
        let _ = self.rx.wait_for(|stop| *stop).await;
    }

    /// Sleeps for `period` unless shutdown comes first. Returns `true` when
    /// the full period elapsed.
    pub async fn sleep(&mut self, period: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.triggered() => false,
            _ = tokio::time::sleep(period) => true,
        }
    }
}
