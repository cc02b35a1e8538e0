use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// One progress event from a running job.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressUpdate {
    pub job_id: Uuid,
    pub progress_pct: u8,
    pub message: String,
}

/// Fire-and-forget progress channel. Sends never block the pipeline; a closed
/// or slow consumer silently drops updates.
#[derive(Clone)]
pub struct ProgressReporter {
    tx: mpsc::UnboundedSender<ProgressUpdate>,
}

impl ProgressReporter {
    /// Reporter plus the receiving end for the caller to drain.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Reporter that discards every update.
    pub fn sink() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }

    /// Reporter that forwards updates into a callback on a spawned task.
    /// Must be called from within a tokio runtime.
    pub fn with_callback<F>(mut callback: F) -> Self
    where
        F: FnMut(u8, &str) + Send + 'static,
    {
        let (reporter, mut rx) = Self::channel();
        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                callback(update.progress_pct, &update.message);
            }
        });
        reporter
    }

    pub fn report(&self, job_id: Uuid, progress_pct: u8, message: impl Into<String>) {
        let update = ProgressUpdate {
            job_id,
            progress_pct,
            message: message.into(),
        };
        tracing::debug!("[{job_id}] {progress_pct}% {}", update.message);
        let _ = self.tx.send(update);
    }
}

/// Cooperative cancellation flag threaded through every stage boundary.
/// Cloned freely; cancelling any clone cancels them all.
#[derive(Clone, Debug)]
pub struct CancellationToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_propagates_to_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        token.cancel();
        // Already-cancelled tokens resolve immediately.
        waiter.cancelled().await;
    }

    #[tokio::test]
    async fn test_updates_arrive_in_order() {
        let (reporter, mut rx) = ProgressReporter::channel();
        let job_id = Uuid::new_v4();
        reporter.report(job_id, 10, "probing");
        reporter.report(job_id, 20, "parsed");

        assert_eq!(rx.recv().await.unwrap().progress_pct, 10);
        assert_eq!(rx.recv().await.unwrap().progress_pct, 20);
    }

    #[test]
    fn test_sink_never_errors() {
        let reporter = ProgressReporter::sink();
        reporter.report(Uuid::new_v4(), 50, "halfway");
    }
}
