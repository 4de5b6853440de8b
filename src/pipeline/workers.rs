use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::batching::Batch;

use super::Pipeline;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

/// Fixed set of tasks pulling flushed batches off one shared queue.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<Batch>>>,
}

pub fn spawn_workers(
    pipeline: Arc<Pipeline>,
    rx: mpsc::UnboundedReceiver<Batch>,
    count: usize,
    shutdown: CancellationToken,
) -> WorkerPool {
    let queue = Arc::new(Mutex::new(rx));
    let handles = (0..count.max(1))
        .map(|worker| {
            tokio::spawn(worker_loop(
                worker,
                Arc::clone(&pipeline),
                Arc::clone(&queue),
                shutdown.clone(),
            ))
        })
        .collect();
    WorkerPool { handles, queue }
}

async fn worker_loop(
    worker: usize,
    pipeline: Arc<Pipeline>,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<Batch>>>,
    shutdown: CancellationToken,
) {
    loop {
        let next = {
            let mut rx = queue.lock().await;
            tokio::select! {
                batch = rx.recv() => batch,
                _ = shutdown.cancelled() => None,
            }
        };
        match next {
            Some(batch) => {
                pipeline.dispatch(batch).await;
            }
            None => break,
        }
    }

    // Finish whatever was flushed before shutdown so no frame goes unanswered.
    loop {
        let next = queue.lock().await.try_recv();
        match next {
            Ok(batch) => {
                pipeline.dispatch(batch).await;
            }
            Err(_) => break,
        }
    }
    log_info!("dispatch worker {} stopped", worker);
}

impl WorkerPool {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker and hand back the queue so it can be reused.
    pub async fn join(self) -> Option<mpsc::UnboundedReceiver<Batch>> {
        for handle in self.handles {
            if let Err(err) = handle.await {
                log_warn!("dispatch worker failed to join: {err:?}");
            }
        }
        Arc::try_unwrap(self.queue).ok().map(Mutex::into_inner)
    }
}
