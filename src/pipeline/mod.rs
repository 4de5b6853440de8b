//! The pipeline object: one owner for the hasher, activity controller, cache,
//! batcher, cost gate and publisher.
//!
//! `process_frame` is the synchronous capture half (hash, pace, look up,
//! batch). `dispatch` is the asynchronous analysis half run by the worker pool
//! (gate, analyze or fall back, publish).

pub mod workers;

use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::analysis::{AnalysisRequest, Analyzer, FallbackAnalyzer, HeuristicFallback};
use crate::batching::{Batch, BatchSettings, BatchedFrame, FlushReason, FrameBatcher};
use crate::cache::{AnalysisCache, CacheKey, CacheStats};
use crate::clock::{Clock, SystemClock};
use crate::config::PipelineConfig;
use crate::cost::{
    CostGate, CostLedger, GateCandidate, GateDecision, GatePolicy, LedgerSummary, RejectReason,
};
use crate::error::{AnalyzerError, ConfigError};
use crate::metrics::{DispatchMetrics, MetricsCollector, MetricsSnapshot, PassMetrics};
use crate::publish::{AnalysisResult, ResultPublisher, Subscriber};
use crate::sensing::{
    ActivityController, ActivityReader, ActivitySettings, ActivitySnapshot, ChangeSignal, Frame,
    FrameHasher,
};
use crate::utils::lock_or_recover;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PassOutcome {
    /// A cached analysis was published without queueing the frame.
    CacheHit,
    /// Change-confidence was below `min_change_confidence`.
    Unchanged,
    Batched,
    /// A frame with the same key is already waiting in the batcher.
    AlreadyPending,
    /// The batcher is shut down.
    Closed,
}

#[derive(Debug, Clone)]
pub struct PassReport {
    pub frame_id: Uuid,
    pub signal: ChangeSignal,
    pub outcome: PassOutcome,
    pub activity: ActivitySnapshot,
    pub result: Option<AnalysisResult>,
    pub hash_ms: u64,
    pub total_ms: u64,
}

/// Why a batch was resolved by the fallback instead of the analyzer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "detail")]
pub enum FallbackCause {
    NoAnalyzer,
    Rejected(RejectReason),
    AnalyzerFailed(String),
    Timeout,
}

impl std::fmt::Display for FallbackCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FallbackCause::NoAnalyzer => f.write_str("no analyzer configured"),
            FallbackCause::Rejected(reason) => write!(f, "gate rejected: {reason}"),
            FallbackCause::AnalyzerFailed(err) => write!(f, "analyzer failed: {err}"),
            FallbackCause::Timeout => f.write_str("analyzer timed out"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum DispatchOutcome {
    Primary,
    Fallback { cause: FallbackCause },
    /// Analyzer and fallback both failed; an error result was published.
    Failed { cause: FallbackCause },
    /// Every frame was already cached by the time the batch was dispatched.
    Cached,
}

#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub batch_id: Uuid,
    pub frames: usize,
    pub cached_frames: usize,
    pub outcome: DispatchOutcome,
    pub results: Vec<AnalysisResult>,
    pub analyzer_ms: Option<u64>,
    pub total_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineReport {
    pub metrics: MetricsSnapshot,
    pub cache: CacheStats,
    pub spend: LedgerSummary,
    pub activity: ActivitySnapshot,
}

struct CaptureStage {
    hasher: FrameHasher,
    activity: ActivityController,
}

pub struct PipelineBuilder {
    config: PipelineConfig,
    analyzer: Option<Arc<dyn Analyzer>>,
    fallback: Option<Arc<dyn FallbackAnalyzer>>,
    clock: Option<Arc<dyn Clock>>,
    subscribers: Vec<Arc<dyn Subscriber>>,
}

impl PipelineBuilder {
    pub fn analyzer(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn fallback(mut self, fallback: Arc<dyn FallbackAnalyzer>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn subscriber(mut self, subscriber: Arc<dyn Subscriber>) -> Self {
        self.subscribers.push(subscriber);
        self
    }

    /// Validate the configuration and assemble the pipeline.
    pub fn build(self) -> Result<Pipeline, ConfigError> {
        self.config.validate()?;
        let config = self.config;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let activity = ActivityController::new(ActivitySettings::from(&config));
        let reader = activity.subscribe();

        let cache = Arc::new(AnalysisCache::new(
            config.max_entries,
            config.ttl(),
            Arc::clone(&clock),
        ));
        let (batcher, dispatch_rx) =
            FrameBatcher::new(BatchSettings::from(&config), Arc::clone(&clock));
        let ledger = Arc::new(CostLedger::new(Arc::clone(&clock)));
        let gate = CostGate::new(
            GatePolicy::from(&config),
            config.cost_model.clone(),
            ledger,
        );
        let publisher = ResultPublisher::new(Arc::clone(&cache), config.fallback_ttl());
        for subscriber in self.subscribers {
            publisher.subscribe(subscriber);
        }

        Ok(Pipeline {
            capture: Mutex::new(CaptureStage {
                hasher: FrameHasher::new(),
                activity,
            }),
            activity: reader,
            cache,
            batcher,
            gate,
            analyzer: self.analyzer,
            fallback: self
                .fallback
                .unwrap_or_else(|| Arc::new(HeuristicFallback::new())),
            publisher,
            metrics: MetricsCollector::new(),
            dispatch_rx: Mutex::new(Some(dispatch_rx)),
            clock,
            config,
        })
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    clock: Arc<dyn Clock>,
    capture: Mutex<CaptureStage>,
    activity: ActivityReader,
    cache: Arc<AnalysisCache>,
    batcher: FrameBatcher,
    gate: CostGate,
    analyzer: Option<Arc<dyn Analyzer>>,
    fallback: Arc<dyn FallbackAnalyzer>,
    publisher: ResultPublisher,
    metrics: MetricsCollector,
    dispatch_rx: Mutex<Option<mpsc::UnboundedReceiver<Batch>>>,
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

impl Pipeline {
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder {
            config,
            analyzer: None,
            fallback: None,
            clock: None,
            subscribers: Vec::new(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<AnalysisCache> {
        &self.cache
    }

    pub fn batcher(&self) -> &FrameBatcher {
        &self.batcher
    }

    pub fn gate(&self) -> &CostGate {
        &self.gate
    }

    pub fn ledger(&self) -> &Arc<CostLedger> {
        self.gate.ledger()
    }

    pub fn activity(&self) -> &ActivityReader {
        &self.activity
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) {
        self.publisher.subscribe(subscriber);
    }

    /// Capture half of one pass. Never suspends; the only locks taken are the
    /// capture stage, the cache and the batch queue, one at a time.
    pub fn process_frame(&self, frame: Frame) -> PassReport {
        let started = Instant::now();
        let min_change = self.config.min_change_confidence;

        let (signal, activity) = {
            let mut stage = lock_or_recover(&self.capture);
            let signal = stage.hasher.observe(&frame);
            stage.activity.record(signal.change_confidence);
            stage.activity.maybe_adjust(self.clock.now());
            if signal.change_confidence >= min_change {
                stage.hasher.accept();
            }
            (signal, stage.activity.snapshot())
        };
        let hash_ms = elapsed_ms(started);
        let frame_id = frame.id;

        let key = CacheKey::new(frame.context.clone(), signal.fingerprint);
        let (outcome, result) = if let Some(entry) = self.cache.get(&key) {
            let result = self
                .publisher
                .publish_cached(None, &frame, signal.fingerprint, &entry);
            (PassOutcome::CacheHit, Some(result))
        } else if signal.change_confidence < min_change {
            (PassOutcome::Unchanged, None)
        } else {
            let queued = BatchedFrame::new(frame, &signal, self.clock.now());
            if self.batcher.offer(queued) {
                (PassOutcome::Batched, None)
            } else if self.batcher.is_closed() {
                (PassOutcome::Closed, None)
            } else {
                (PassOutcome::AlreadyPending, None)
            }
        };

        log_debug!(
            "frame {} similarity {:.3} confidence {:.3} -> {:?} ({:.2} fps)",
            frame_id,
            signal.similarity,
            signal.change_confidence,
            outcome,
            activity.fps
        );

        PassReport {
            frame_id,
            signal,
            outcome,
            activity,
            result,
            hash_ms,
            total_ms: elapsed_ms(started),
        }
    }

    /// Run `process_frame` on the blocking pool and record its metrics.
    pub async fn ingest(self: &Arc<Self>, frame: Frame) -> Result<PassReport> {
        let pipeline = Arc::clone(self);
        let report = tokio::task::spawn_blocking(move || pipeline.process_frame(frame))
            .await
            .context("frame processing worker join failed")?;

        let (cpu_percent, memory_mb) = self.metrics.sample_system_metrics().await;
        self.metrics
            .record_pass(PassMetrics {
                timestamp: Utc::now(),
                frame_id: report.frame_id,
                hash_ms: report.hash_ms,
                total_ms: report.total_ms,
                change_confidence: report.signal.change_confidence,
                fps: report.activity.fps,
                outcome: report.outcome,
                cpu_percent,
                memory_mb,
            })
            .await;
        Ok(report)
    }

    /// Analysis half for one batch. Frames cached since they were queued are
    /// answered from the cache; the rest go through the gate to the analyzer
    /// or the fallback. Exactly one result is published per resolved batch,
    /// plus one per cache-answered frame.
    pub async fn dispatch(&self, batch: Batch) -> DispatchReport {
        let started = Instant::now();
        let batch_id = batch.id;
        let total_frames = batch.len();
        let mut results = Vec::new();

        let mut fresh = Vec::with_capacity(batch.frames.len());
        for queued in batch.frames {
            // The miss was already counted at capture time; only count a hit here.
            let key = queued.key();
            let entry = if self.cache.contains(&key) {
                self.cache.get(&key)
            } else {
                None
            };
            match entry {
                Some(entry) => results.push(self.publisher.publish_cached(
                    Some(batch_id),
                    &queued.frame,
                    queued.fingerprint,
                    &entry,
                )),
                None => fresh.push(queued),
            }
        }
        let cached_frames = results.len();

        let Some(request) = AnalysisRequest::from_frames(batch_id, &fresh) else {
            return self
                .finish(DispatchReport {
                    batch_id,
                    frames: total_frames,
                    cached_frames,
                    outcome: DispatchOutcome::Cached,
                    results,
                    analyzer_ms: None,
                    total_ms: elapsed_ms(started),
                })
                .await;
        };

        let mut analyzer_ms = None;
        let cause = match &self.analyzer {
            None => FallbackCause::NoAnalyzer,
            Some(analyzer) => {
                let candidate = GateCandidate {
                    cache_hit: false,
                    change_confidence: fresh
                        .iter()
                        .map(|f| f.change_confidence)
                        .fold(0.0, f64::max),
                    estimate: self
                        .gate
                        .model()
                        .estimate_batch(request.dimensions, request.batch_context.len()),
                    activity_level: self.activity.level(),
                };

                match self.gate.admit(&candidate) {
                    GateDecision::Rejected(reason) => FallbackCause::Rejected(reason),
                    GateDecision::Approved { ledger_id, .. } => {
                        let timeout = self.config.analyzer_timeout();
                        let call_started = Instant::now();
                        let call = tokio::time::timeout(timeout, analyzer.analyze(&request)).await;
                        analyzer_ms = Some(elapsed_ms(call_started));
                        match call {
                            Ok(Ok(output)) => {
                                self.gate.complete(ledger_id);
                                if let Some(result) =
                                    self.publisher.publish_primary(batch_id, &fresh, output)
                                {
                                    log_info!(
                                        "batch {} analyzed by {} ({} frame(s))",
                                        batch_id,
                                        analyzer.name(),
                                        fresh.len()
                                    );
                                    results.push(result);
                                }
                                return self
                                    .finish(DispatchReport {
                                        batch_id,
                                        frames: total_frames,
                                        cached_frames,
                                        outcome: DispatchOutcome::Primary,
                                        results,
                                        analyzer_ms,
                                        total_ms: elapsed_ms(started),
                                    })
                                    .await;
                            }
                            Ok(Err(AnalyzerError::Timeout(after))) => {
                                self.gate.fail(ledger_id);
                                log_warn!(
                                    "analyzer reported a timeout after {:?} for batch {}",
                                    after,
                                    batch_id
                                );
                                FallbackCause::Timeout
                            }
                            Ok(Err(err)) => {
                                self.gate.fail(ledger_id);
                                log_warn!("analyzer failed for batch {}: {}", batch_id, err);
                                FallbackCause::AnalyzerFailed(err.to_string())
                            }
                            Err(_) => {
                                self.gate.fail(ledger_id);
                                log_warn!(
                                    "analyzer timed out after {:?} for batch {}",
                                    timeout,
                                    batch_id
                                );
                                FallbackCause::Timeout
                            }
                        }
                    }
                }
            }
        };

        let fallback = Arc::clone(&self.fallback);
        let fallback_request = request.clone();
        let fallback_result =
            tokio::task::spawn_blocking(move || fallback.analyze(&fallback_request)).await;

        let outcome = match fallback_result {
            Ok(Ok(output)) => {
                log_debug!("batch {} resolved by fallback ({})", batch_id, cause);
                results.extend(self.publisher.publish_fallback(batch_id, &fresh, output));
                DispatchOutcome::Fallback { cause }
            }
            Ok(Err(err)) => {
                let reason = format!("{cause}; fallback failed: {err}");
                results.extend(self.publisher.publish_failure(batch_id, &fresh, &reason));
                DispatchOutcome::Failed { cause }
            }
            Err(join_err) => {
                let reason = format!("{cause}; fallback panicked: {join_err}");
                results.extend(self.publisher.publish_failure(batch_id, &fresh, &reason));
                DispatchOutcome::Failed { cause }
            }
        };

        self.finish(DispatchReport {
            batch_id,
            frames: total_frames,
            cached_frames,
            outcome,
            results,
            analyzer_ms,
            total_ms: elapsed_ms(started),
        })
        .await
    }

    async fn finish(&self, report: DispatchReport) -> DispatchReport {
        self.metrics
            .record_dispatch(DispatchMetrics {
                timestamp: Utc::now(),
                batch_id: report.batch_id,
                frames: report.frames,
                cached_frames: report.cached_frames,
                analyzer_ms: report.analyzer_ms,
                total_ms: report.total_ms,
                outcome: report.outcome.clone(),
            })
            .await;
        report
    }

    pub fn flush_expired(&self) -> Option<Uuid> {
        self.batcher.flush_expired()
    }

    pub fn flush_pending(&self) -> Option<Uuid> {
        self.batcher.flush(FlushReason::Shutdown)
    }

    /// Flush the queue and stop accepting frames.
    pub fn close(&self) -> Option<Uuid> {
        self.batcher.close()
    }

    pub fn reopen(&self) {
        self.batcher.reopen();
    }

    /// Hand the receiving end of the batch queue to a worker pool.
    pub fn take_dispatch_queue(&self) -> Option<mpsc::UnboundedReceiver<Batch>> {
        lock_or_recover(&self.dispatch_rx).take()
    }

    pub fn restore_dispatch_queue(&self, rx: mpsc::UnboundedReceiver<Batch>) {
        *lock_or_recover(&self.dispatch_rx) = Some(rx);
    }

    /// Dispatch every batch already flushed, in flush order, on the calling
    /// task. For embedding without a worker pool.
    pub async fn dispatch_ready(&self) -> Vec<DispatchReport> {
        let batches = {
            let mut slot = lock_or_recover(&self.dispatch_rx);
            let mut batches = Vec::new();
            if let Some(rx) = slot.as_mut() {
                while let Ok(batch) = rx.try_recv() {
                    batches.push(batch);
                }
            }
            batches
        };

        let mut reports = Vec::with_capacity(batches.len());
        for batch in batches {
            reports.push(self.dispatch(batch).await);
        }
        reports
    }

    pub async fn report(&self) -> PipelineReport {
        PipelineReport {
            metrics: self.metrics.get_snapshot().await,
            cache: self.cache.stats(),
            spend: self.ledger().summary(),
            activity: self.activity.snapshot(),
        }
    }
}
