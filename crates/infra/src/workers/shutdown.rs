//! Cooperative shutdown signal.

use tokio::sync::watch;

/// Receiving side; `true` once shutdown was requested.
pub type ShutdownSignal = watch::Receiver<bool>;

/// Sending side of a [`ShutdownSignal`].
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn subscribe(&self) -> ShutdownSignal {
        self.tx.subscribe()
    }
}

pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, rx)
}

/// Resolves once shutdown is requested.
///
/// If every trigger is dropped without firing, this never resolves.
pub async fn shutdown_requested(signal: &mut ShutdownSignal) {
    loop {
        if *signal.borrow_and_update() {
            return;
        }
        if signal.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
