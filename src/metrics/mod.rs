mod types;

pub use types::{DispatchMetrics, MetricsSnapshot, PassMetrics, PipelineCounters, SystemMetrics};

use std::collections::VecDeque;
use std::sync::Arc;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::Mutex;

use crate::pipeline::{DispatchOutcome, FallbackCause, PassOutcome};

const MAX_RECENT_PASSES: usize = 20;
const MAX_RECENT_DISPATCHES: usize = 20;

/// Shared pipeline counters plus process CPU and memory. Clones share state.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsState>>,
}

struct MetricsState {
    recent_passes: VecDeque<PassMetrics>,
    recent_dispatches: VecDeque<DispatchMetrics>,
    counters: PipelineCounters,
    system: System,
    pid: Pid,
}

impl MetricsState {
    fn sample(&mut self) -> SystemMetrics {
        let pid = self.pid;
        self.system.refresh_processes(ProcessesToUpdate::Some(&[pid]));
        match self.system.process(pid) {
            Some(process) => SystemMetrics {
                cpu_percent: process.cpu_usage(),
                memory_mb: process.memory() as f64 / 1024.0 / 1024.0,
            },
            None => SystemMetrics::default(),
        }
    }
}

fn count_cause(counters: &mut PipelineCounters, cause: &FallbackCause) {
    match cause {
        FallbackCause::Rejected(_) => counters.gate_rejections += 1,
        FallbackCause::AnalyzerFailed(_) => counters.analyzer_failures += 1,
        FallbackCause::Timeout => counters.analyzer_timeouts += 1,
        FallbackCause::NoAnalyzer => {}
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        let mut system = System::new();
        let pid = Pid::from_u32(std::process::id());

        // CPU usage is a delta between refreshes, so take a baseline now.
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]));

        Self {
            inner: Arc::new(Mutex::new(MetricsState {
                recent_passes: VecDeque::with_capacity(MAX_RECENT_PASSES),
                recent_dispatches: VecDeque::with_capacity(MAX_RECENT_DISPATCHES),
                counters: PipelineCounters::default(),
                system,
                pid,
            })),
        }
    }

    /// Current process CPU percent and resident memory in MB.
    pub async fn sample_system_metrics(&self) -> (f32, f64) {
        let sample = self.inner.lock().await.sample();
        (sample.cpu_percent, sample.memory_mb)
    }

    pub async fn record_pass(&self, metrics: PassMetrics) {
        let mut state = self.inner.lock().await;
        let counters = &mut state.counters;
        counters.frames_captured += 1;
        match metrics.outcome {
            PassOutcome::CacheHit => counters.cache_hits += 1,
            PassOutcome::Unchanged => counters.unchanged_skips += 1,
            PassOutcome::Batched => counters.batched += 1,
            PassOutcome::AlreadyPending => counters.already_pending += 1,
            PassOutcome::Closed => {}
        }

        state.recent_passes.push_back(metrics);
        while state.recent_passes.len() > MAX_RECENT_PASSES {
            state.recent_passes.pop_front();
        }
    }

    pub async fn record_dispatch(&self, metrics: DispatchMetrics) {
        let mut state = self.inner.lock().await;
        let counters = &mut state.counters;
        counters.batches_dispatched += 1;
        counters.cache_hits += metrics.cached_frames as u64;
        match &metrics.outcome {
            DispatchOutcome::Primary => counters.primary_calls += 1,
            DispatchOutcome::Fallback { cause } => {
                counters.fallback_calls += 1;
                count_cause(counters, cause);
            }
            DispatchOutcome::Failed { cause } => {
                counters.failed_results += 1;
                count_cause(counters, cause);
            }
            DispatchOutcome::Cached => {}
        }

        state.recent_dispatches.push_back(metrics);
        while state.recent_dispatches.len() > MAX_RECENT_DISPATCHES {
            state.recent_dispatches.pop_front();
        }
    }

    pub async fn counters(&self) -> PipelineCounters {
        self.inner.lock().await.counters
    }

    pub async fn get_snapshot(&self) -> MetricsSnapshot {
        let mut state = self.inner.lock().await;
        let system = state.sample();
        MetricsSnapshot {
            system,
            counters: state.counters,
            recent_passes: state.recent_passes.iter().cloned().collect(),
            recent_dispatches: state.recent_dispatches.iter().cloned().collect(),
        }
    }

    pub async fn reset(&self) {
        let mut state = self.inner.lock().await;
        state.recent_passes.clear();
        state.recent_dispatches.clear();
        state.counters = PipelineCounters::default();
        state.sample();
    }
}
