//! Groups changed frames so one analysis call can describe a short burst.
//!
//! A batch is flushed as soon as it holds `batch_size` frames (synchronously,
//! from `offer`) or once its oldest frame has waited `batch_timeout` (from the
//! periodic ticker calling `flush_expired`). Flushed batches are handed to the
//! dispatch workers over an unbounded channel after the queue lock is released.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::cache::CacheKey;
use crate::clock::Clock;
use crate::config::PipelineConfig;
use crate::sensing::{ChangeSignal, Fingerprint, Frame};
use crate::utils::lock_or_recover;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_warn};

const HIGH_TIER_CONFIDENCE: f64 = 0.7;
const MEDIUM_TIER_CONFIDENCE: f64 = 0.4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PriorityTier {
    Low,
    Medium,
    High,
}

impl PriorityTier {
    pub fn from_confidence(change_confidence: f64) -> Self {
        if change_confidence >= HIGH_TIER_CONFIDENCE {
            PriorityTier::High
        } else if change_confidence >= MEDIUM_TIER_CONFIDENCE {
            PriorityTier::Medium
        } else {
            PriorityTier::Low
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchedFrame {
    pub frame: Frame,
    pub fingerprint: Fingerprint,
    pub change_confidence: f64,
    pub dimensions: Option<(u32, u32)>,
    pub enqueued_at: Instant,
    pub tier: PriorityTier,
    seq: u64,
}

impl BatchedFrame {
    pub fn new(frame: Frame, signal: &ChangeSignal, enqueued_at: Instant) -> Self {
        Self {
            frame,
            fingerprint: signal.fingerprint,
            change_confidence: signal.change_confidence,
            dimensions: signal.dimensions,
            enqueued_at,
            tier: PriorityTier::from_confidence(signal.change_confidence),
            seq: 0,
        }
    }

    pub fn key(&self) -> CacheKey {
        CacheKey::new(self.frame.context.clone(), self.fingerprint)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FlushReason {
    Size,
    Timeout,
    Shutdown,
}

/// Frames flushed together, highest priority and most recent first.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: Uuid,
    pub frames: Vec<BatchedFrame>,
    pub reason: FlushReason,
    pub created_at: DateTime<Utc>,
}

impl Batch {
    pub fn primary(&self) -> Option<&BatchedFrame> {
        self.frames.first()
    }

    pub fn secondary(&self) -> &[BatchedFrame] {
        self.frames.get(1..).unwrap_or(&[])
    }

    pub fn max_change_confidence(&self) -> f64 {
        self.frames
            .iter()
            .map(|f| f.change_confidence)
            .fold(0.0, f64::max)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BatchSettings {
    pub batch_size: usize,
    pub timeout: Duration,
}

impl From<&PipelineConfig> for BatchSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            timeout: config.batch_timeout(),
        }
    }
}

#[derive(Default)]
struct Queue {
    frames: Vec<BatchedFrame>,
    next_seq: u64,
    closed: bool,
}

pub struct FrameBatcher {
    settings: BatchSettings,
    clock: Arc<dyn Clock>,
    queue: Mutex<Queue>,
    tx: mpsc::UnboundedSender<Batch>,
}

impl FrameBatcher {
    pub fn new(
        settings: BatchSettings,
        clock: Arc<dyn Clock>,
    ) -> (Self, mpsc::UnboundedReceiver<Batch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let batcher = Self {
            settings,
            clock,
            queue: Mutex::new(Queue::default()),
            tx,
        };
        (batcher, rx)
    }

    pub fn settings(&self) -> BatchSettings {
        self.settings
    }

    /// Queue a frame. Returns false when the batcher is closed or a frame with
    /// the same key is already waiting. Fills to `batch_size` flush immediately.
    pub fn offer(&self, mut frame: BatchedFrame) -> bool {
        let ready = {
            let mut queue = lock_or_recover(&self.queue);
            if queue.closed {
                return false;
            }
            let key = frame.key();
            if queue.frames.iter().any(|queued| queued.key() == key) {
                return false;
            }
            frame.seq = queue.next_seq;
            queue.next_seq += 1;
            queue.frames.push(frame);

            if queue.frames.len() >= self.settings.batch_size {
                Some(std::mem::take(&mut queue.frames))
            } else {
                None
            }
        };

        if let Some(frames) = ready {
            self.dispatch(frames, FlushReason::Size);
        }
        true
    }

    /// Flush if the oldest queued frame has waited at least `batch_timeout`.
    pub fn flush_expired(&self) -> Option<Uuid> {
        let now = self.clock.now();
        let frames = {
            let mut queue = lock_or_recover(&self.queue);
            let oldest = queue.frames.iter().map(|f| f.enqueued_at).min()?;
            if now.saturating_duration_since(oldest) < self.settings.timeout {
                return None;
            }
            std::mem::take(&mut queue.frames)
        };
        self.dispatch(frames, FlushReason::Timeout)
    }

    pub fn flush(&self, reason: FlushReason) -> Option<Uuid> {
        let frames = std::mem::take(&mut lock_or_recover(&self.queue).frames);
        self.dispatch(frames, reason)
    }

    /// Flush whatever is queued and refuse further offers.
    pub fn close(&self) -> Option<Uuid> {
        let frames = {
            let mut queue = lock_or_recover(&self.queue);
            queue.closed = true;
            std::mem::take(&mut queue.frames)
        };
        self.dispatch(frames, FlushReason::Shutdown)
    }

    /// Accept offers again after `close`.
    pub fn reopen(&self) {
        lock_or_recover(&self.queue).closed = false;
    }

    pub fn is_closed(&self) -> bool {
        lock_or_recover(&self.queue).closed
    }

    pub fn pending(&self) -> usize {
        lock_or_recover(&self.queue).frames.len()
    }

    fn dispatch(&self, mut frames: Vec<BatchedFrame>, reason: FlushReason) -> Option<Uuid> {
        if frames.is_empty() {
            return None;
        }
        frames.sort_by(|a, b| b.tier.cmp(&a.tier).then(b.seq.cmp(&a.seq)));

        let batch = Batch {
            id: Uuid::new_v4(),
            frames,
            reason,
            created_at: Utc::now(),
        };
        let id = batch.id;
        log_debug!(
            "flushing batch {} ({} frames, {:?})",
            id,
            batch.frames.len(),
            reason
        );
        if self.tx.send(batch).is_err() {
            log_warn!("batch {} dropped: dispatch queue is gone", id);
            return None;
        }
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::sensing::ImageRef;

    fn settings(batch_size: usize) -> BatchSettings {
        BatchSettings {
            batch_size,
            timeout: Duration::from_secs(5),
        }
    }

    fn batched(content: &str, confidence: f64, at: Instant) -> BatchedFrame {
        let frame = Frame::new(ImageRef::encoded(content.as_bytes().to_vec()), "Editor");
        let signal = ChangeSignal {
            fingerprint: Fingerprint::of(content.as_bytes()),
            similarity: 1.0 - confidence,
            change_confidence: confidence,
            dimensions: None,
        };
        BatchedFrame::new(frame, &signal, at)
    }

    #[test]
    fn tiers_follow_confidence() {
        assert_eq!(PriorityTier::from_confidence(0.9), PriorityTier::High);
        assert_eq!(PriorityTier::from_confidence(0.7), PriorityTier::High);
        assert_eq!(PriorityTier::from_confidence(0.6), PriorityTier::Medium);
        assert_eq!(PriorityTier::from_confidence(0.3), PriorityTier::Low);
    }

    #[test]
    fn full_batch_flushes_in_priority_order() {
        let clock = ManualClock::new();
        let (batcher, mut rx) = FrameBatcher::new(settings(3), Arc::new(clock.clone()));

        for (content, confidence) in [("a", 0.9), ("b", 0.3), ("c", 0.6)] {
            assert!(batcher.offer(batched(content, confidence, clock.now())));
        }

        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.reason, FlushReason::Size);
        let order: Vec<f64> = batch.frames.iter().map(|f| f.change_confidence).collect();
        assert_eq!(order, vec![0.9, 0.6, 0.3]);
        assert_eq!(batch.primary().unwrap().change_confidence, 0.9);
        assert_eq!(batch.secondary().len(), 2);
        assert_eq!(batcher.pending(), 0);
    }

    #[test]
    fn same_tier_puts_most_recent_first() {
        let clock = ManualClock::new();
        let (batcher, mut rx) = FrameBatcher::new(settings(2), Arc::new(clock.clone()));

        batcher.offer(batched("older", 0.8, clock.now()));
        clock.advance(Duration::from_secs(1));
        batcher.offer(batched("newer", 0.75, clock.now()));

        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.frames[0].change_confidence, 0.75);
        assert_eq!(batch.frames[1].change_confidence, 0.8);
    }

    #[test]
    fn timeout_flush_waits_for_oldest_frame() {
        let clock = ManualClock::new();
        let (batcher, mut rx) = FrameBatcher::new(settings(3), Arc::new(clock.clone()));

        batcher.offer(batched("a", 0.5, clock.now()));
        clock.advance(Duration::from_secs(3));
        batcher.offer(batched("b", 0.5, clock.now()));

        clock.advance(Duration::from_secs(1));
        assert!(batcher.flush_expired().is_none());
        assert!(rx.try_recv().is_err());

        clock.advance(Duration::from_secs(1));
        assert!(batcher.flush_expired().is_some());
        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.reason, FlushReason::Timeout);
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn empty_queue_never_flushes() {
        let clock = ManualClock::new();
        let (batcher, mut rx) = FrameBatcher::new(settings(3), Arc::new(clock.clone()));
        clock.advance(Duration::from_secs(60));
        assert!(batcher.flush_expired().is_none());
        assert!(batcher.flush(FlushReason::Shutdown).is_none());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn duplicate_key_is_not_queued_twice() {
        let clock = ManualClock::new();
        let (batcher, _rx) = FrameBatcher::new(settings(3), Arc::new(clock.clone()));
        assert!(batcher.offer(batched("same", 0.9, clock.now())));
        assert!(!batcher.offer(batched("same", 0.9, clock.now())));
        assert_eq!(batcher.pending(), 1);
    }

    #[test]
    fn close_flushes_and_rejects_new_frames() {
        let clock = ManualClock::new();
        let (batcher, mut rx) = FrameBatcher::new(settings(3), Arc::new(clock.clone()));
        batcher.offer(batched("a", 0.9, clock.now()));

        assert!(batcher.close().is_some());
        assert_eq!(rx.try_recv().unwrap().reason, FlushReason::Shutdown);
        assert!(!batcher.offer(batched("b", 0.9, clock.now())));
        assert!(batcher.is_closed());
    }
}
