//! Analysis providers: the expensive analyzer behind the cost gate and the
//! cheap local fallback.

pub mod fallback;
pub mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::batching::BatchedFrame;
use crate::error::{AnalyzerError, FallbackError};
use crate::sensing::{Fingerprint, ImageRef};

pub use fallback::HeuristicFallback;
pub use http::HttpVisionAnalyzer;

/// Confidence attached to primary results when the provider reports none.
pub const DEFAULT_PRIMARY_CONFIDENCE: f64 = 0.88;

/// A secondary frame sent along with the primary one.
#[derive(Debug, Clone)]
pub struct ContextImage {
    pub frame_id: Uuid,
    pub image: ImageRef,
    pub context: String,
    pub change_confidence: f64,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub batch_id: Uuid,
    pub frame_id: Uuid,
    pub primary: ImageRef,
    pub context: String,
    pub fingerprint: Fingerprint,
    pub dimensions: Option<(u32, u32)>,
    pub prompt: String,
    pub batch_context: Vec<ContextImage>,
}

impl AnalysisRequest {
    /// Build a request from frames already in dispatch order. The first frame
    /// is the primary image.
    pub fn from_frames(batch_id: Uuid, frames: &[BatchedFrame]) -> Option<Self> {
        let (primary, rest) = frames.split_first()?;
        let batch_context = rest
            .iter()
            .map(|f| ContextImage {
                frame_id: f.frame.id,
                image: f.frame.image.clone(),
                context: f.frame.context.clone(),
                change_confidence: f.change_confidence,
                captured_at: f.frame.captured_at,
            })
            .collect::<Vec<_>>();

        Some(Self {
            batch_id,
            frame_id: primary.frame.id,
            primary: primary.frame.image.clone(),
            context: primary.frame.context.clone(),
            fingerprint: primary.fingerprint,
            dimensions: primary.dimensions,
            prompt: build_prompt(&primary.frame.context, batch_context.len()),
            batch_context,
        })
    }
}

pub fn build_prompt(context: &str, secondary_frames: usize) -> String {
    let mut prompt = format!(
        "Describe what is on this screen. The active application is \"{context}\". \
         Name the task the user appears to be doing and quote any prominent text."
    );
    if secondary_frames > 0 {
        prompt.push_str(&format!(
            " {secondary_frames} related frame(s) from the same burst of activity are attached \
             for context. They may be older or newer than this screen and may show other \
             applications; mention them only where they clarify what the user is doing."
        ));
    }
    prompt
}

/// Raw provider output before normalisation.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzerOutput {
    pub text: String,
    pub confidence: Option<f64>,
}

/// Expensive "describe this frame" provider. Called only after the cost gate
/// approves, always under a timeout, never retried.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalyzerOutput, AnalyzerError>;

    fn name(&self) -> &str {
        "analyzer"
    }
}

/// Cheap local analysis. Synchronous and CPU bound; callers run it on the
/// blocking pool.
pub trait FallbackAnalyzer: Send + Sync {
    fn analyze(&self, request: &AnalysisRequest) -> Result<AnalyzerOutput, FallbackError>;
}
