use std::sync::Arc;

use tokio::sync::watch;

/// Cooperative cancellation shared by the scheduler, its workers and every
/// running command. Cloning yields a handle to the same signal.
#[derive(Debug, Clone)]
pub struct Cancel {
  tx: Arc<watch::Sender<bool>>,
  rx: watch::Receiver<bool>,
}

impl Default for Cancel {
  fn default() -> Self {
    Self::new()
  }
}

impl Cancel {
  pub fn new() -> Self {
    let (tx, rx) = watch::channel(false);
    Self { tx: Arc::new(tx), rx }
  }

  pub fn cancel(&self) {
    self.tx.send_replace(true);
  }

  pub fn is_cancelled(&self) -> bool {
    *self.rx.borrow()
  }

  /// Resolves once `cancel()` was called on any clone.
  pub async fn cancelled(&self) {
    let mut rx = self.rx.clone();
    // the sender lives as long as self, so this only returns on cancel
    let _ = rx.wait_for(|cancelled| *cancelled).await;
  }
}
