//! Bounded ingestion queue drained by a fixed worker pool

use crate::ingest::pipeline::{Exchange, IngestPipeline};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Submission handle. Cheap to clone; all clones share one sender, so
/// [`IngestQueue::close`] stops intake everywhere.
#[derive(Clone)]
pub struct IngestQueue {
    tx: Arc<std::sync::Mutex<Option<mpsc::Sender<Exchange>>>>,
}

/// Worker tasks behind an [`IngestQueue`].
pub struct IngestWorkers {
    handles: Vec<JoinHandle<()>>,
}

impl IngestQueue {
    /// Spawn `workers` tasks sharing one queue of `capacity` exchanges.
    pub fn spawn(
        pipeline: Arc<IngestPipeline>,
        workers: usize,
        capacity: usize,
    ) -> (Self, IngestWorkers) {
        let (tx, rx) = mpsc::channel::<Exchange>(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let handles = (0..workers.max(1))
            .map(|worker| {
                let rx = rx.clone();
                let pipeline = pipeline.clone();
                tokio::spawn(async move {
                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some(exchange) = next else { break };
                        match pipeline.ingest(&exchange).await {
                            Ok(_) => {}
                            Err(e) if e.is_degradable() => {
                                tracing::warn!(
                                    worker,
                                    conversation_id = %exchange.conversation_id,
                                    error = %e,
                                    "Exchange skipped"
                                );
                            }
                            Err(e) => {
                                tracing::error!(
                                    worker,
                                    conversation_id = %exchange.conversation_id,
                                    error = %e,
                                    "Ingestion failed"
                                );
                            }
                        }
                    }
                    tracing::debug!(worker, "Ingestion worker stopped");
                })
            })
            .collect();

        let queue = Self {
            tx: Arc::new(std::sync::Mutex::new(Some(tx))),
        };
        (queue, IngestWorkers { handles })
    }

    fn sender(&self) -> Option<mpsc::Sender<Exchange>> {
        self.tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Enqueue an exchange without waiting.
    ///
    /// Returns false (and logs) when the queue is full or closed.
    pub fn submit(&self, exchange: Exchange) -> bool {
        let Some(tx) = self.sender() else {
            tracing::warn!(
                conversation_id = %exchange.conversation_id,
                "Ingestion stopped, exchange not ingested"
            );
            return false;
        };
        match tx.try_send(exchange) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(ex)) => {
                tracing::warn!(
                    conversation_id = %ex.conversation_id,
                    "Ingestion queue full, exchange not ingested"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(ex)) => {
                tracing::error!(
                    conversation_id = %ex.conversation_id,
                    "Ingestion queue closed, exchange not ingested"
                );
                false
            }
        }
    }

    /// Exchanges waiting for a worker
    pub fn pending(&self) -> usize {
        self.sender()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0)
    }

    /// Stop accepting exchanges. Queued ones are still processed.
    pub fn close(&self) {
        self.tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }

    pub fn is_closed(&self) -> bool {
        self.sender().is_none()
    }
}

impl IngestWorkers {
    /// Wait for workers to drain. Completes once every queue handle is dropped.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!("Ingestion worker panicked: {}", e);
            }
        }
    }
}
