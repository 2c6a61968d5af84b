//! Pause/resume flag consulted between job starts.

use tokio::sync::watch;

/// Shared paused/resumed flag.
///
/// Running jobs are unaffected by pausing; callers check the gate at their
/// own checkpoints (before starting the next job) with [`StartGate::wait_open`].
#[derive(Clone)]
pub struct StartGate {
    tx: watch::Sender<bool>,
}

impl StartGate {
    /// Create an open (resumed) gate.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Stop new starts at the next checkpoint.
    pub fn pause(&self) {
        if !self.tx.send_replace(true) {
            tracing::info!("start gate paused");
        }
    }

    /// Allow starts again and wake every waiting checkpoint.
    pub fn resume(&self) {
        if self.tx.send_replace(false) {
            tracing::info!("start gate resumed");
        }
    }

    /// Whether the gate is currently paused.
    pub fn is_paused(&self) -> bool {
        *self.tx.borrow()
    }

    /// Suspend until the gate is open. Returns immediately when not paused.
    pub async fn wait_open(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|paused| !*paused).await;
    }
}

impl Default for StartGate {
    fn default() -> Self {
        Self::new()
    }
}
