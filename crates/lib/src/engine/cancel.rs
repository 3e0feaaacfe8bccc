use std::sync::Arc;

use tokio::sync::watch;

/// A cloneable interrupt signal shared by everything one build launches.
#[derive(Debug, Clone)]
pub struct Cancellation {
  sender: Arc<watch::Sender<bool>>,
  receiver: watch::Receiver<bool>,
}

impl Default for Cancellation {
  fn default() -> Self {
    Self::new()
  }
}

impl Cancellation {
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

  /// Resolves once `cancel` has been called on any clone.
  pub async fn cancelled(&self) {
    let mut receiver = self.receiver.clone();
    if receiver.wait_for(|cancelled| *cancelled).await.is_err() {
      std::future::pending::<()>().await;
    }
  }
}
