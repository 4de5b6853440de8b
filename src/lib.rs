//! Screen-understanding pipeline: decide which captured frames are worth
//! analysing, reuse answers for screens already seen, batch the rest, and keep
//! a paid vision analyzer inside an hourly budget with a local fallback.

pub mod analysis;
pub mod batching;
pub mod cache;
pub mod clock;
pub mod config;
pub mod cost;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod publish;
pub mod sensing;
mod utils;

pub use analysis::{
    AnalysisRequest, Analyzer, AnalyzerOutput, FallbackAnalyzer, HeuristicFallback,
    HttpVisionAnalyzer,
};
pub use batching::{Batch, BatchedFrame, FrameBatcher, PriorityTier};
pub use cache::{AnalysisCache, CacheKey, CacheStats};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::PipelineConfig;
pub use cost::{CostGate, CostLedger, CostModel, GateDecision};
pub use error::{AnalyzerError, ConfigError, FallbackError, FrameError};
pub use metrics::MetricsCollector;
pub use pipeline::{DispatchOutcome, PassOutcome, Pipeline, PipelineReport};
pub use publish::{AnalysisResult, ChannelSubscriber, LogSubscriber, ResultSource, Subscriber};
pub use sensing::{
    CaptureSource, DirectorySource, Frame, FrameHasher, ImageRef, MemorySource,
    PipelineController,
};

/// Initialise logging (reads RUST_LOG env var). Safe to call more than once.
pub fn init_logging() {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .try_init();
}
