//! Normalises analyzer output into one result shape, caches it, and fans it
//! out to subscribers.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::analysis::{AnalyzerOutput, DEFAULT_PRIMARY_CONFIDENCE};
use crate::batching::BatchedFrame;
use crate::cache::{AnalysisCache, CacheEntry, CachedResult};
use crate::sensing::{Fingerprint, Frame};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ResultSource {
    Primary,
    Fallback,
    Error,
}

impl ResultSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultSource::Primary => "primary",
            ResultSource::Fallback => "fallback",
            ResultSource::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub id: Uuid,
    /// Batch the result resolves. `None` for cache hits served at capture time.
    pub batch_id: Option<Uuid>,
    pub frame_ids: Vec<Uuid>,
    pub context: String,
    pub fingerprint: Fingerprint,
    pub text: String,
    pub confidence: f64,
    pub source: ResultSource,
    pub cached: bool,
    pub produced_at: DateTime<Utc>,
}

/// Receives every resolved frame or batch exactly once.
pub trait Subscriber: Send + Sync {
    fn publish(&self, result: &AnalysisResult);
}

/// Forwards results into a tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelSubscriber {
    tx: mpsc::UnboundedSender<AnalysisResult>,
}

impl ChannelSubscriber {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AnalysisResult>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Subscriber for ChannelSubscriber {
    fn publish(&self, result: &AnalysisResult) {
        // A dropped receiver only means nobody is listening any more.
        let _ = self.tx.send(result.clone());
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogSubscriber;

impl Subscriber for LogSubscriber {
    fn publish(&self, result: &AnalysisResult) {
        log::info!(
            "[{}{}] {} ({:.2}) {}",
            result.source.as_str(),
            if result.cached { ", cached" } else { "" },
            result.context,
            result.confidence,
            result.text
        );
    }
}

pub struct ResultPublisher {
    cache: Arc<AnalysisCache>,
    fallback_ttl: Duration,
    subscribers: RwLock<Vec<Arc<dyn Subscriber>>>,
}

impl ResultPublisher {
    pub fn new(cache: Arc<AnalysisCache>, fallback_ttl: Duration) -> Self {
        Self {
            cache,
            fallback_ttl,
            subscribers: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) {
        match self.subscribers.write() {
            Ok(mut subs) => subs.push(subscriber),
            Err(poisoned) => poisoned.into_inner().push(subscriber),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        match self.subscribers.read() {
            Ok(subs) => subs.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    fn notify(&self, result: &AnalysisResult) {
        let subscribers = match self.subscribers.read() {
            Ok(subs) => subs.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for subscriber in subscribers {
            subscriber.publish(result);
        }
    }

    fn build(
        batch_id: Option<Uuid>,
        frames: &[BatchedFrame],
        text: String,
        confidence: f64,
        source: ResultSource,
    ) -> Option<AnalysisResult> {
        let primary = frames.first()?;
        Some(AnalysisResult {
            id: Uuid::new_v4(),
            batch_id,
            frame_ids: frames.iter().map(|f| f.frame.id).collect(),
            context: primary.frame.context.clone(),
            fingerprint: primary.fingerprint,
            text,
            confidence,
            source,
            cached: false,
            produced_at: Utc::now(),
        })
    }

    /// Cache under the keys of frames sharing the primary frame's context.
    /// Frames from other applications ride along as context only; the
    /// description does not apply to them.
    fn store(&self, frames: &[BatchedFrame], result: &AnalysisResult, ttl: Duration) {
        let cached = CachedResult {
            text: result.text.clone(),
            source: result.source,
        };
        for frame in frames
            .iter()
            .filter(|f| f.frame.context == result.context)
        {
            self.cache
                .put_with_ttl(frame.key(), cached.clone(), result.confidence, ttl);
        }
    }

    /// Analyzer success. Cached under every same-context frame of the batch.
    pub fn publish_primary(
        &self,
        batch_id: Uuid,
        frames: &[BatchedFrame],
        output: AnalyzerOutput,
    ) -> Option<AnalysisResult> {
        let confidence = output
            .confidence
            .unwrap_or(DEFAULT_PRIMARY_CONFIDENCE)
            .clamp(0.0, 1.0);
        let result = Self::build(
            Some(batch_id),
            frames,
            output.text,
            confidence,
            ResultSource::Primary,
        )?;
        self.store(frames, &result, self.cache.ttl());
        self.notify(&result);
        Some(result)
    }

    /// Fallback result. Cached with the shorter fallback lifetime so a later
    /// primary analysis can replace it sooner.
    pub fn publish_fallback(
        &self,
        batch_id: Uuid,
        frames: &[BatchedFrame],
        output: AnalyzerOutput,
    ) -> Option<AnalysisResult> {
        let confidence = output.confidence.unwrap_or(0.5).clamp(0.0, 1.0);
        let result = Self::build(
            Some(batch_id),
            frames,
            output.text,
            confidence,
            ResultSource::Fallback,
        )?;
        self.store(frames, &result, self.fallback_ttl);
        self.notify(&result);
        Some(result)
    }

    /// Both analyzers failed. Published with zero confidence and never cached.
    pub fn publish_failure(
        &self,
        batch_id: Uuid,
        frames: &[BatchedFrame],
        reason: &str,
    ) -> Option<AnalysisResult> {
        let result = Self::build(
            Some(batch_id),
            frames,
            format!("analysis unavailable: {reason}"),
            0.0,
            ResultSource::Error,
        )?;
        log_error!(
            "batch {} failed ({} frame(s)): {}",
            batch_id,
            result.frame_ids.len(),
            reason
        );
        self.notify(&result);
        Some(result)
    }

    /// Re-publish a cache entry for one frame, keeping its original source.
    pub fn publish_cached(
        &self,
        batch_id: Option<Uuid>,
        frame: &Frame,
        fingerprint: Fingerprint,
        entry: &CacheEntry,
    ) -> AnalysisResult {
        let result = AnalysisResult {
            id: Uuid::new_v4(),
            batch_id,
            frame_ids: vec![frame.id],
            context: frame.context.clone(),
            fingerprint,
            text: entry.result.text.clone(),
            confidence: entry.confidence,
            source: entry.result.source,
            cached: true,
            produced_at: Utc::now(),
        };
        log_info!(
            "cache hit for {} ({}), access #{}",
            frame.context,
            fingerprint,
            entry.access_count
        );
        self.notify(&result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::sensing::{ChangeSignal, ImageRef};
    use std::time::Instant;

    fn setup() -> (
        ResultPublisher,
        Arc<AnalysisCache>,
        mpsc::UnboundedReceiver<AnalysisResult>,
        ManualClock,
    ) {
        let clock = ManualClock::new();
        let cache = Arc::new(AnalysisCache::new(
            50,
            Duration::from_secs(300),
            Arc::new(clock.clone()),
        ));
        let publisher = ResultPublisher::new(Arc::clone(&cache), Duration::from_secs(60));
        let (subscriber, rx) = ChannelSubscriber::channel();
        publisher.subscribe(Arc::new(subscriber));
        (publisher, cache, rx, clock)
    }

    fn frames(contents: &[&str]) -> Vec<BatchedFrame> {
        frames_in(contents.iter().map(|content| ("Editor", *content)))
    }

    fn frames_in<'a>(items: impl IntoIterator<Item = (&'a str, &'a str)>) -> Vec<BatchedFrame> {
        items
            .into_iter()
            .map(|(context, content)| {
                let signal = ChangeSignal {
                    fingerprint: Fingerprint::of(content.as_bytes()),
                    similarity: 0.2,
                    change_confidence: 0.8,
                    dimensions: None,
                };
                BatchedFrame::new(
                    Frame::new(ImageRef::encoded(content.as_bytes().to_vec()), context),
                    &signal,
                    Instant::now(),
                )
            })
            .collect()
    }

    #[test]
    fn primary_result_uses_default_confidence_and_caches_every_frame() {
        let (publisher, cache, mut rx, _clock) = setup();
        let batch = frames(&["a", "b"]);
        let output = AnalyzerOutput {
            text: "An editor".into(),
            confidence: None,
        };
        let result = publisher
            .publish_primary(Uuid::new_v4(), &batch, output)
            .unwrap();

        assert_eq!(result.source, ResultSource::Primary);
        assert_eq!(result.confidence, DEFAULT_PRIMARY_CONFIDENCE);
        assert_eq!(result.frame_ids.len(), 2);
        for frame in &batch {
            assert_eq!(cache.peek(&frame.key()).unwrap().result.text, "An editor");
        }
        assert_eq!(rx.try_recv().unwrap().id, result.id);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn mixed_context_batch_caches_only_the_primary_context() {
        let (publisher, cache, mut rx, _clock) = setup();
        let batch = frames_in([("Editor", "main.rs"), ("Browser", "docs"), ("Editor", "lib.rs")]);
        let result = publisher
            .publish_primary(
                Uuid::new_v4(),
                &batch,
                AnalyzerOutput {
                    text: "A code editor showing main.rs".into(),
                    confidence: None,
                },
            )
            .unwrap();

        assert_eq!(result.context, "Editor");
        assert_eq!(result.frame_ids.len(), 3);
        assert!(cache.peek(&batch[0].key()).is_some());
        assert!(cache.peek(&batch[1].key()).is_none());
        assert!(cache.peek(&batch[2].key()).is_some());
        assert_eq!(cache.len(), 2);
        assert_eq!(rx.try_recv().unwrap().id, result.id);
    }

    #[test]
    fn fallback_entries_expire_sooner() {
        let (publisher, cache, _rx, clock) = setup();
        let batch = frames(&["a"]);
        publisher.publish_fallback(
            Uuid::new_v4(),
            &batch,
            AnalyzerOutput {
                text: "mixed screen".into(),
                confidence: Some(0.55),
            },
        );
        let key = batch[0].key();
        assert_eq!(cache.peek(&key).unwrap().result.source, ResultSource::Fallback);

        clock.advance(Duration::from_secs(61));
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn failure_is_published_but_not_cached() {
        let (publisher, cache, mut rx, _clock) = setup();
        let batch = frames(&["a"]);
        let result = publisher
            .publish_failure(Uuid::new_v4(), &batch, "both analyzers failed")
            .unwrap();
        assert_eq!(result.source, ResultSource::Error);
        assert_eq!(result.confidence, 0.0);
        assert!(cache.is_empty());
        assert_eq!(rx.try_recv().unwrap().source, ResultSource::Error);
    }

    #[test]
    fn cached_result_keeps_its_source() {
        let (publisher, cache, mut rx, _clock) = setup();
        let batch = frames(&["a"]);
        publisher.publish_fallback(
            Uuid::new_v4(),
            &batch,
            AnalyzerOutput {
                text: "blank".into(),
                confidence: Some(0.55),
            },
        );
        let _ = rx.try_recv();

        let entry = cache.get(&batch[0].key()).unwrap();
        let result = publisher.publish_cached(None, &batch[0].frame, batch[0].fingerprint, &entry);
        assert!(result.cached);
        assert_eq!(result.source, ResultSource::Fallback);
        assert_eq!(result.confidence, 0.55);
        assert_eq!(rx.try_recv().unwrap().id, result.id);
    }

    #[test]
    fn empty_batch_publishes_nothing() {
        let (publisher, _cache, mut rx, _clock) = setup();
        let output = AnalyzerOutput {
            text: "x".into(),
            confidence: None,
        };
        assert!(publisher.publish_primary(Uuid::new_v4(), &[], output).is_none());
        assert!(rx.try_recv().is_err());
    }
}
