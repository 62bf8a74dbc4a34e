use std::sync::Arc;

use tokio::sync::watch;

/// Process-wide cancellation signal.
///
/// One `Shutdown` is created per process (or per test) and a listener is
/// handed to every live session driver and poller; triggering it makes each
/// of them run its own teardown. This replaces any notion of a single global
/// cleanup slot: every listener is an independent value.
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
        }
    }

    /// Fire the signal. Idempotent.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

/// One receiver of the process-wide signal.
#[derive(Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownListener {
    /// Resolve once the signal has been triggered. If the `Shutdown` source
    /// is dropped without triggering, this never resolves.
    pub async fn triggered(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }
}
