//! Shared cancellation signal for session tasks.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::sync::Notify;

/// Idempotent stop signal. Every session task selects on [`StopToken::wait`]
/// and must exit promptly once the token fires.
#[derive(Clone, Default)]
pub struct StopToken {
    stopped: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub async fn wait(&self) {
        loop {
            if self.is_stopped() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stop_is_idempotent_and_sticky() {
        let token = StopToken::new();
        token.stop();
        token.stop();
        assert!(token.is_stopped());
        // A waiter arriving after the signal returns immediately.
        token.wait().await;
    }
}
