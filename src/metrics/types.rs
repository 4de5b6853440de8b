use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::pipeline::{DispatchOutcome, PassOutcome};

/// Timing and outcome of one capture pass.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassMetrics {
    pub timestamp: DateTime<Utc>,
    pub frame_id: Uuid,
    pub hash_ms: u64,
    pub total_ms: u64,
    pub change_confidence: f64,
    pub fps: f64,
    pub outcome: PassOutcome,
    pub cpu_percent: f32,
    pub memory_mb: f64,
}

/// Timing and outcome of one batch dispatch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchMetrics {
    pub timestamp: DateTime<Utc>,
    pub batch_id: Uuid,
    pub frames: usize,
    pub cached_frames: usize,
    pub analyzer_ms: Option<u64>,
    pub total_ms: u64,
    pub outcome: DispatchOutcome,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineCounters {
    pub frames_captured: u64,
    pub unchanged_skips: u64,
    pub cache_hits: u64,
    pub batched: u64,
    pub already_pending: u64,
    pub batches_dispatched: u64,
    pub primary_calls: u64,
    pub fallback_calls: u64,
    pub gate_rejections: u64,
    pub analyzer_failures: u64,
    pub analyzer_timeouts: u64,
    pub failed_results: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetrics {
    pub cpu_percent: f32,
    pub memory_mb: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub system: SystemMetrics,
    pub counters: PipelineCounters,
    pub recent_passes: Vec<PassMetrics>,
    pub recent_dispatches: Vec<DispatchMetrics>,
}
