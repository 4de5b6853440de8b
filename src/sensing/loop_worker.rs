use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::pipeline::Pipeline;

use super::source::CaptureSource;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

// Import the logging macros (exported at crate root)
use crate::{log_debug, log_error, log_info, log_warn};

const CAPTURE_TIMEOUT_SECS: u64 = 10;

/// Pull frames from `source` and feed them through the capture half of the
/// pipeline, sleeping for the activity controller's current interval between
/// passes. Ends when the source runs dry, on cancel, or once a drain request
/// lets the in-flight pass finish.
pub async fn capture_loop(
    pipeline: Arc<Pipeline>,
    mut source: Box<dyn CaptureSource>,
    cancel_token: CancellationToken,
    mut drain_rx: watch::Receiver<bool>,
) {
    loop {
        if *drain_rx.borrow() {
            log_info!("capture loop drained");
            break;
        }

        let next = tokio::select! {
            next = tokio::time::timeout(Duration::from_secs(CAPTURE_TIMEOUT_SECS), source.next_frame()) => next,
            _ = cancel_token.cancelled() => {
                log_info!("capture loop shutting down");
                break;
            }
        };

        match next {
            Ok(Ok(Some(frame))) => match pipeline.ingest(frame).await {
                Ok(report) => log_debug!(
                    "pass {:?} in {}ms (hash {}ms)",
                    report.outcome,
                    report.total_ms,
                    report.hash_ms
                ),
                Err(err) => log_error!("frame processing failed: {err:?}"),
            },
            Ok(Ok(None)) => {
                log_info!("capture source exhausted");
                break;
            }
            Ok(Err(err)) => log_error!("frame capture failed: {err:?}"),
            Err(_) => log_warn!("frame capture timeout (> {}s)", CAPTURE_TIMEOUT_SECS),
        }

        let interval = pipeline.activity().snapshot().interval();
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel_token.cancelled() => {
                log_info!("capture loop shutting down");
                break;
            }
            changed = drain_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}

/// Flush batches whose oldest frame has waited out the batch timeout.
pub async fn batch_flush_loop(
    pipeline: Arc<Pipeline>,
    tick: Duration,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Some(batch_id) = pipeline.flush_expired() {
                    log_debug!("batch {} flushed on timeout", batch_id);
                }
            }
            _ = cancel_token.cancelled() => break,
        }
    }
}
