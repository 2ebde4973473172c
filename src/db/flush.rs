//! Debounced flush actor.
//!
//! One task owns the dirty flag and the deadline. Mutations send `Dirty`;
//! the first one after a flush arms a deadline, later ones inside the window
//! are absorbed, and a single flush runs when the deadline passes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::LedgerError;
use crate::thresholds;

/// Anything that can persist a snapshot of itself synchronously.
pub trait SnapshotTarget: Send + Sync + 'static {
    fn flush_snapshot(&self) -> Result<(), LedgerError>;
}

pub(crate) enum FlushMsg {
    Dirty,
    /// Flush now if dirty; replies whether a flush ran.
    Flush(oneshot::Sender<Result<bool, LedgerError>>),
    /// Final flush if dirty, then exit.
    Shutdown(oneshot::Sender<Result<bool, LedgerError>>),
}

pub struct Flusher {
    tx: mpsc::UnboundedSender<FlushMsg>,
    handle: JoinHandle<()>,
}

impl Flusher {
    pub fn spawn<T: SnapshotTarget>(target: Arc<T>, debounce: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(target, debounce, rx));
        Self { tx, handle }
    }

    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<FlushMsg> {
        self.tx.clone()
    }

    pub fn mark_dirty(&self) {
        let _ = self.tx.send(FlushMsg::Dirty);
    }

    /// Flush pending state immediately. Ok(false) means nothing was dirty.
    pub async fn flush_now(&self) -> Result<bool, LedgerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(FlushMsg::Flush(reply))
            .map_err(|_| LedgerError::Internal("flusher stopped".into()))?;
        rx.await
            .map_err(|_| LedgerError::Internal("flusher dropped reply".into()))?
    }

    /// Final flush bounded by `timeout`, then stop the actor.
    pub async fn shutdown(self, timeout: Duration) -> Result<bool, LedgerError> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(FlushMsg::Shutdown(reply)).is_err() {
            return Ok(false);
        }
        let result = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(r)) => r,
            Ok(Err(_)) => Err(LedgerError::Internal("flusher dropped reply".into())),
            Err(_) => {
                self.handle.abort();
                return Err(LedgerError::Internal(format!(
                    "shutdown flush exceeded {}ms",
                    timeout.as_millis()
                )));
            }
        };
        let _ = self.handle.await;
        result
    }
}

async fn run<T: SnapshotTarget>(
    target: Arc<T>,
    debounce: Duration,
    mut rx: mpsc::UnboundedReceiver<FlushMsg>,
) {
    let mut deadline: Option<Instant> = None;
    loop {
        let msg = match deadline {
            Some(at) => match tokio::time::timeout_at(at, rx.recv()).await {
                Ok(msg) => msg,
                Err(_) => {
                    deadline = flush_once(&target, debounce).await.err().map(|(_, retry_at)| retry_at);
                    continue;
                }
            },
            None => rx.recv().await,
        };
        match msg {
            Some(FlushMsg::Dirty) => {
                // Fixed deadline from the first dirty signal: bursts coalesce,
                // and a steady trickle of writes cannot postpone the flush forever.
                if deadline.is_none() {
                    deadline = Some(Instant::now() + debounce);
                }
            }
            Some(FlushMsg::Flush(reply)) => {
                let result = if deadline.is_some() {
                    match flush_once(&target, debounce).await {
                        Ok(()) => {
                            deadline = None;
                            Ok(true)
                        }
                        Err((e, retry_at)) => {
                            deadline = Some(retry_at);
                            Err(e)
                        }
                    }
                } else {
                    Ok(false)
                };
                let _ = reply.send(result);
            }
            Some(FlushMsg::Shutdown(reply)) => {
                let result = if deadline.is_some() {
                    flush_once(&target, debounce)
                        .await
                        .map(|()| true)
                        .map_err(|(e, _)| e)
                } else {
                    Ok(false)
                };
                let _ = reply.send(result);
                debug!("flusher stopped");
                return;
            }
            None => {
                if deadline.is_some() {
                    let _ = flush_once(&target, debounce).await;
                }
                debug!("flusher channel closed");
                return;
            }
        }
    }
}

/// Run one flush on the blocking pool. On failure returns the cause and the
/// retry deadline.
async fn flush_once<T: SnapshotTarget>(target: &Arc<T>, debounce: Duration) -> Result<(), (LedgerError, Instant)> {
    let t = Arc::clone(target);
    let limit = Duration::from_secs(thresholds::FLUSH_TIMEOUT_SECS);
    let started = std::time::Instant::now();
    let outcome = tokio::time::timeout(limit, tokio::task::spawn_blocking(move || t.flush_snapshot())).await;
    match outcome {
        Ok(Ok(Ok(()))) => {
            debug!(elapsed_ms = started.elapsed().as_millis() as u64, "snapshot flush complete");
            Ok(())
        }
        Ok(Ok(Err(e))) => {
            warn!(error = %e, "snapshot flush failed");
            Err((e, Instant::now() + debounce))
        }
        Ok(Err(e)) => {
            warn!(error = %e, "snapshot flush task panicked");
            Err((LedgerError::Internal(format!("flush task failed: {e}")), Instant::now() + debounce))
        }
        Err(_) => {
            warn!(limit_secs = limit.as_secs(), "snapshot flush timed out");
            let e = LedgerError::Internal(format!("flush exceeded {}s", limit.as_secs()));
            Err((e, Instant::now() + debounce))
        }
    }
}
