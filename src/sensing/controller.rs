use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::info;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::pipeline::workers::{spawn_workers, WorkerPool};
use crate::pipeline::Pipeline;

use super::loop_worker::{batch_flush_loop, capture_loop};
use super::source::CaptureSource;

/// Owns the capture loop, the batch flush ticker and the dispatch workers for
/// one pipeline.
pub struct PipelineController {
    pipeline: Arc<Pipeline>,
    capture: Option<JoinHandle<()>>,
    ticker: Option<JoinHandle<()>>,
    workers: Option<WorkerPool>,
    cancel_token: Option<CancellationToken>,
    worker_token: Option<CancellationToken>,
    drain_tx: Option<watch::Sender<bool>>,
}

impl PipelineController {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self {
            pipeline,
            capture: None,
            ticker: None,
            workers: None,
            cancel_token: None,
            worker_token: None,
            drain_tx: None,
        }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn is_running(&self) -> bool {
        self.capture.is_some()
    }

    pub fn start(&mut self, source: Box<dyn CaptureSource>) -> Result<()> {
        if self.capture.is_some() {
            bail!("pipeline already running");
        }
        let Some(queue) = self.pipeline.take_dispatch_queue() else {
            bail!("dispatch queue is held elsewhere");
        };
        self.pipeline.reopen();

        let cancel_token = CancellationToken::new();
        let worker_token = CancellationToken::new();

        // Create drain channel: false = normal operation, true = finish the current pass then exit
        let (drain_tx, drain_rx) = watch::channel(false);

        let workers = spawn_workers(
            Arc::clone(&self.pipeline),
            queue,
            self.pipeline.config().worker_count,
            worker_token.clone(),
        );
        let ticker = tokio::spawn(batch_flush_loop(
            Arc::clone(&self.pipeline),
            self.pipeline.config().batch_tick(),
            cancel_token.clone(),
        ));
        let capture = tokio::spawn(capture_loop(
            Arc::clone(&self.pipeline),
            source,
            cancel_token.clone(),
            drain_rx,
        ));

        info!("pipeline started with {} dispatch worker(s)", workers.len());
        self.capture = Some(capture);
        self.ticker = Some(ticker);
        self.workers = Some(workers);
        self.cancel_token = Some(cancel_token);
        self.worker_token = Some(worker_token);
        self.drain_tx = Some(drain_tx);
        Ok(())
    }

    /// Signal the capture loop to drain: finish the current pass but don't start new ones
    pub fn drain(&mut self) {
        if let Some(tx) = &self.drain_tx {
            let _ = tx.send(true);
            info!("Drain signal sent to capture loop");
        }
    }

    /// Wait for the capture loop to end on its own, e.g. when the source runs dry.
    pub async fn wait_for_capture(&mut self) -> Result<()> {
        match self.capture.as_mut() {
            Some(handle) => {
                let joined = handle.await;
                self.capture = None;
                joined.context("capture loop task failed to join")
            }
            None => Ok(()),
        }
    }

    /// Stop capturing, flush what is queued, and let the workers answer every
    /// flushed batch before returning.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }
        self.drain_tx = None;

        let capture = match self.capture.take() {
            Some(handle) => handle.await.context("capture loop task failed to join"),
            None => Ok(()),
        };
        if let Some(handle) = self.ticker.take() {
            handle.await.context("batch ticker task failed to join")?;
        }

        self.pipeline.close();

        if let Some(token) = self.worker_token.take() {
            token.cancel();
        }
        if let Some(workers) = self.workers.take() {
            if let Some(queue) = workers.join().await {
                self.pipeline.restore_dispatch_queue(queue);
            }
        }
        info!("pipeline stopped");
        capture
    }
}
