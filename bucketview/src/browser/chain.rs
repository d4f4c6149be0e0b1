use std::future::Future;
use std::pin::Pin;

use tokio::sync::{mpsc, oneshot};

pub(super) type ChainStep = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Single-consumer queue of completion steps. Steps run one at a time in
/// submission order, whatever order the work feeding them finishes in.
pub(super) struct CompletionChain {
    tx: mpsc::UnboundedSender<ChainStep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct ChainClosed;

impl CompletionChain {
    /// Must be called from inside a tokio runtime.
    pub(super) fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<ChainStep>();
        tokio::spawn(async move {
            while let Some(step) = rx.recv().await {
                step.await;
            }
            tracing::trace!("completion chain drained and closed");
        });
        Self { tx }
    }

    pub(super) fn push(&self, step: ChainStep) -> Result<(), ChainClosed> {
        self.tx.send(step).map_err(|_| ChainClosed)
    }

    /// Resolves once every step queued before this call has run.
    pub(super) async fn flush(&self) -> Result<(), ChainClosed> {
        let (done, wait) = oneshot::channel();
        self.push(Box::pin(async move {
            let _ = done.send(());
        }))?;
        wait.await.map_err(|_| ChainClosed)
    }
}
