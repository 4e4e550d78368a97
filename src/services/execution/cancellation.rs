use std::sync::Arc;
use tokio::sync::watch;

/// Cooperative cancellation flag shared by a statement, its shard tasks and its cursor
#[derive(Debug, Clone)]
pub struct CancellationToken {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once `cancel` has been called on any clone
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        // The sender lives as long as `self`, so this only returns on cancellation
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }

    /// Cancels the token when the returned guard is dropped
    pub fn drop_guard(&self) -> DropGuard {
        DropGuard { token: self.clone() }
    }
}

/// Cancels its token on drop, so an abandoned request stops its shard work
#[derive(Debug)]
pub struct DropGuard {
    token: CancellationToken,
}

impl Drop for DropGuard {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}
