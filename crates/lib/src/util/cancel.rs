//! Cooperative cancellation for staging, deploy and destroy runs.

use std::sync::Arc;

use tokio::sync::watch;

/// A cloneable flag that stops new element work once set.
///
/// In-flight provider calls are never aborted; the engine checks the token
/// between elements and waves.
#[derive(Debug, Clone)]
pub struct CancelToken {
  tx: Arc<watch::Sender<bool>>,
  rx: watch::Receiver<bool>,
}

impl Default for CancelToken {
  fn default() -> Self {
    Self::new()
  }
}

impl CancelToken {
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

  /// Resolves once the token is cancelled.
  pub async fn cancelled(&self) {
    let mut rx = self.rx.clone();
    while !*rx.borrow_and_update() {
      if rx.changed().await.is_err() {
        std::future::pending::<()>().await;
      }
    }
  }
}
