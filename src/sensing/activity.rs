use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;

use crate::config::PipelineConfig;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::log_debug;

/// Coarse classification of the activity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ActivityBand {
    Quiet,
    Normal,
    Active,
}

/// Consistent view of the controller state, readable from any thread.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivitySnapshot {
    pub level: f64,
    pub fps: f64,
    pub band: ActivityBand,
}

impl ActivitySnapshot {
    /// Time to sleep between captures at the current rate.
    pub fn interval(&self) -> Duration {
        Duration::try_from_secs_f64(1.0 / self.fps).unwrap_or(Duration::from_secs(1))
    }
}

#[derive(Debug, Clone)]
pub struct ActivitySettings {
    pub window: usize,
    pub min_fps: f64,
    pub max_fps: f64,
    pub neutral_fps: f64,
    pub step: f64,
    pub quiet_threshold: f64,
    pub active_threshold: f64,
    pub control_interval: Duration,
}

impl From<&PipelineConfig> for ActivitySettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            window: config.activity_window,
            min_fps: config.min_fps,
            max_fps: config.max_fps,
            neutral_fps: config.neutral_fps,
            step: config.fps_step,
            quiet_threshold: config.quiet_threshold,
            active_threshold: config.active_threshold,
            control_interval: config.control_interval(),
        }
    }
}

/// Read-only handle onto the controller's latest snapshot.
#[derive(Debug, Clone)]
pub struct ActivityReader {
    rx: watch::Receiver<ActivitySnapshot>,
}

impl ActivityReader {
    pub fn snapshot(&self) -> ActivitySnapshot {
        *self.rx.borrow()
    }

    pub fn level(&self) -> f64 {
        self.rx.borrow().level
    }
}

/// Rolling window of change-confidences mapped onto a sampling rate by a
/// stepwise hysteresis rule. Mutated only by the capture loop.
pub struct ActivityController {
    settings: ActivitySettings,
    window: VecDeque<f64>,
    fps: f64,
    last_adjust: Option<Instant>,
    tx: watch::Sender<ActivitySnapshot>,
}

impl ActivityController {
    pub fn new(settings: ActivitySettings) -> Self {
        let fps = settings
            .neutral_fps
            .clamp(settings.min_fps, settings.max_fps);
        let (tx, _rx) = watch::channel(ActivitySnapshot {
            level: 0.0,
            fps,
            band: ActivityBand::Normal,
        });
        let controller = Self {
            window: VecDeque::with_capacity(settings.window),
            settings,
            fps,
            last_adjust: None,
            tx,
        };
        controller.publish();
        controller
    }

    pub fn subscribe(&self) -> ActivityReader {
        ActivityReader {
            rx: self.tx.subscribe(),
        }
    }

    /// Push one change-confidence into the window, dropping the oldest sample
    /// once the window is full.
    pub fn record(&mut self, change_confidence: f64) {
        let value = if change_confidence.is_finite() {
            change_confidence.clamp(0.0, 1.0)
        } else {
            1.0
        };
        self.window.push_back(value);
        while self.window.len() > self.settings.window {
            self.window.pop_front();
        }
        self.publish();
    }

    /// Mean of the window, clamped to [0, 1]. An empty window reads as 0.
    pub fn level(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.window.iter().sum();
        (sum / self.window.len() as f64).clamp(0.0, 1.0)
    }

    pub fn band(&self) -> ActivityBand {
        self.band_for(self.level())
    }

    fn band_for(&self, level: f64) -> ActivityBand {
        if level < self.settings.quiet_threshold {
            ActivityBand::Quiet
        } else if level > self.settings.active_threshold {
            ActivityBand::Active
        } else {
            ActivityBand::Normal
        }
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn interval(&self) -> Duration {
        self.snapshot().interval()
    }

    pub fn snapshot(&self) -> ActivitySnapshot {
        let level = self.level();
        ActivitySnapshot {
            level,
            fps: self.fps,
            band: self.band_for(level),
        }
    }

    /// Run one control cycle if `control_interval` has passed since the last.
    /// The first call only starts the cycle clock. Returns whether a cycle ran.
    pub fn maybe_adjust(&mut self, now: Instant) -> bool {
        let Some(last) = self.last_adjust else {
            self.last_adjust = Some(now);
            return false;
        };
        if now.saturating_duration_since(last) < self.settings.control_interval {
            return false;
        }
        self.last_adjust = Some(now);
        self.adjust();
        true
    }

    /// Move the rate one step according to the current activity level. With no
    /// samples yet the rate is left alone.
    pub fn adjust(&mut self) {
        if self.window.is_empty() {
            return;
        }

        let s = &self.settings;
        let previous = self.fps;
        let next = match self.band() {
            ActivityBand::Quiet => (self.fps - s.step).max(s.min_fps),
            ActivityBand::Active => (self.fps + s.step).min(s.max_fps),
            ActivityBand::Normal => {
                if self.fps < s.neutral_fps {
                    (self.fps + s.step).min(s.neutral_fps)
                } else {
                    (self.fps - s.step).max(s.neutral_fps)
                }
            }
        };
        self.fps = next.clamp(s.min_fps, s.max_fps);

        if (self.fps - previous).abs() > f64::EPSILON {
            log_debug!(
                "activity {:.2} ({:?}): sampling rate {:.2} -> {:.2} fps",
                self.level(),
                self.band(),
                previous,
                self.fps
            );
        }
        self.publish();
    }

    fn publish(&self) {
        self.tx.send_replace(self.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ActivitySettings {
        ActivitySettings::from(&PipelineConfig::default())
    }

    #[test]
    fn starts_at_neutral_rate() {
        let controller = ActivityController::new(settings());
        assert_eq!(controller.fps(), 1.0);
        assert_eq!(controller.interval(), Duration::from_secs(1));
        assert_eq!(controller.level(), 0.0);
    }

    #[test]
    fn window_is_bounded_fifo() {
        let mut controller = ActivityController::new(ActivitySettings {
            window: 3,
            ..settings()
        });
        for value in [1.0, 1.0, 1.0, 0.0, 0.0, 0.0] {
            controller.record(value);
        }
        assert_eq!(controller.level(), 0.0);
        controller.record(0.9);
        assert!((controller.level() - 0.3).abs() < 1e-9);
    }

    #[test]
    fn quiet_screen_steps_down_to_min() {
        let mut controller = ActivityController::new(settings());
        for _ in 0..20 {
            controller.record(0.0);
            controller.adjust();
        }
        assert_eq!(controller.fps(), 0.2);
        assert_eq!(controller.band(), ActivityBand::Quiet);
    }

    #[test]
    fn busy_screen_steps_up_to_max() {
        let mut controller = ActivityController::new(settings());
        controller.record(0.95);
        controller.adjust();
        assert!((controller.fps() - 1.2).abs() < 1e-9);
        for _ in 0..20 {
            controller.record(0.95);
            controller.adjust();
        }
        assert_eq!(controller.fps(), 2.0);
    }

    #[test]
    fn moderate_activity_relaxes_toward_neutral() {
        let mut controller = ActivityController::new(settings());
        for _ in 0..20 {
            controller.record(1.0);
            controller.adjust();
        }
        assert_eq!(controller.fps(), 2.0);

        let mut moderate = ActivityController::new(ActivitySettings {
            window: 1,
            ..settings()
        });
        for _ in 0..20 {
            moderate.record(1.0);
            moderate.adjust();
        }
        for _ in 0..20 {
            moderate.record(0.5);
            moderate.adjust();
        }
        assert!((moderate.fps() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn rate_always_within_bounds() {
        let mut controller = ActivityController::new(ActivitySettings {
            window: 5,
            min_fps: 0.5,
            max_fps: 1.5,
            step: 0.35,
            ..settings()
        });
        let pattern = [0.0, 1.0, 0.3, 0.9, 0.05, 0.75, 0.5, 1.0, 1.0, 0.0];
        for round in 0..50 {
            let value = pattern[(round * 7) % pattern.len()];
            controller.record(value);
            controller.adjust();
            let fps = controller.fps();
            assert!((0.5..=1.5).contains(&fps), "fps {fps} out of bounds");
            let interval = controller.interval().as_secs_f64();
            assert!(interval >= 1.0 / 1.5 - 1e-6 && interval <= 1.0 / 0.5 + 1e-6);
        }
    }

    #[test]
    fn adjusts_only_once_per_control_interval() {
        let mut controller = ActivityController::new(settings());
        let start = Instant::now();
        controller.record(0.0);

        assert!(!controller.maybe_adjust(start));
        assert!(!controller.maybe_adjust(start + Duration::from_secs(4)));
        assert_eq!(controller.fps(), 1.0);

        assert!(controller.maybe_adjust(start + Duration::from_secs(5)));
        assert!((controller.fps() - 0.8).abs() < 1e-9);
        assert!(!controller.maybe_adjust(start + Duration::from_secs(6)));
    }

    #[test]
    fn reader_sees_latest_snapshot() {
        let mut controller = ActivityController::new(settings());
        let reader = controller.subscribe();
        controller.record(0.9);
        controller.adjust();

        let snapshot = reader.snapshot();
        assert_eq!(snapshot.band, ActivityBand::Active);
        assert!((snapshot.level - 0.9).abs() < 1e-9);
        assert_eq!(snapshot.fps, controller.fps());
    }
}
