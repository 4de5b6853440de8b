use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cost::CostModel;
use crate::error::ConfigError;

/// Change-confidence a batch must exceed before the expensive analyzer is
/// considered, per activity band.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ConfidenceThresholds {
    pub quiet: f64,
    pub normal: f64,
    pub active: f64,
}

impl Default for ConfidenceThresholds {
    fn default() -> Self {
        Self {
            quiet: 0.4,
            normal: 0.25,
            active: 0.15,
        }
    }
}

/// Every numeric knob of the pipeline. Missing fields take their defaults, so a
/// partial JSON file is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Maximum age of a cached analysis.
    pub ttl_seconds: f64,
    /// Effective age limit for fallback results; capped at `ttl_seconds`.
    pub fallback_ttl_seconds: f64,
    /// Cache capacity. Zero disables caching.
    pub max_entries: usize,

    pub min_fps: f64,
    pub max_fps: f64,
    /// Rate the controller relaxes toward when activity is neither quiet nor busy.
    pub neutral_fps: f64,
    /// Rate change applied per control cycle.
    pub fps_step: f64,
    /// Number of recent change-confidences averaged into the activity level.
    pub activity_window: usize,
    pub control_interval_seconds: f64,
    pub quiet_threshold: f64,
    pub active_threshold: f64,
    /// Frames whose change-confidence falls below this are treated as unchanged.
    pub min_change_confidence: f64,

    pub batch_size: usize,
    pub batch_timeout_seconds: f64,
    pub batch_tick_millis: u64,

    /// Trailing one-hour spend (USD) above which every call goes to the fallback.
    pub cost_threshold_per_hour: f64,
    /// Largest estimated cost (USD) a single analyzer call may have.
    pub per_call_cost_ceiling: f64,
    pub confidence_thresholds: ConfidenceThresholds,
    pub cost_model: CostModel,

    pub analyzer_timeout_seconds: f64,
    pub worker_count: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 300.0,
            fallback_ttl_seconds: 60.0,
            max_entries: 50,
            min_fps: 0.2,
            max_fps: 2.0,
            neutral_fps: 1.0,
            fps_step: 0.2,
            activity_window: 45,
            control_interval_seconds: 5.0,
            quiet_threshold: 0.2,
            active_threshold: 0.7,
            min_change_confidence: 0.05,
            batch_size: 3,
            batch_timeout_seconds: 5.0,
            batch_tick_millis: 500,
            cost_threshold_per_hour: 0.50,
            per_call_cost_ceiling: 0.05,
            confidence_thresholds: ConfidenceThresholds::default(),
            cost_model: CostModel::default(),
            analyzer_timeout_seconds: 8.0,
            worker_count: 2,
        }
    }
}

fn non_negative(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::Negative { field, value });
    }
    Ok(())
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    non_negative(field, value)?;
    if value == 0.0 {
        return Err(ConfigError::Zero { field });
    }
    Ok(())
}

fn unit_interval(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::OutsideUnitInterval { field, value });
    }
    Ok(())
}

fn nonzero(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Zero { field });
    }
    Ok(())
}

fn representable(field: &'static str, value: f64) -> Result<(), ConfigError> {
    non_negative(field, value)?;
    if Duration::try_from_secs_f64(value).is_err() {
        return Err(ConfigError::DurationOutOfRange { field, value });
    }
    Ok(())
}

/// Only called on validated values, which always convert.
fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
}

impl PipelineConfig {
    /// Read a JSON configuration file and validate it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline config from {}", path.display()))?;
        let config: PipelineConfig = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse pipeline config {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid pipeline config {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        representable("ttl_seconds", self.ttl_seconds)?;
        representable("fallback_ttl_seconds", self.fallback_ttl_seconds)?;

        positive("min_fps", self.min_fps)?;
        representable("1 / min_fps", 1.0 / self.min_fps)?;
        positive("max_fps", self.max_fps)?;
        if self.min_fps > self.max_fps {
            return Err(ConfigError::FpsBounds {
                min: self.min_fps,
                max: self.max_fps,
            });
        }
        non_negative("neutral_fps", self.neutral_fps)?;
        if self.neutral_fps < self.min_fps || self.neutral_fps > self.max_fps {
            return Err(ConfigError::NeutralFps {
                neutral: self.neutral_fps,
                min: self.min_fps,
                max: self.max_fps,
            });
        }
        positive("fps_step", self.fps_step)?;
        nonzero("activity_window", self.activity_window)?;
        positive("control_interval_seconds", self.control_interval_seconds)?;
        representable("control_interval_seconds", self.control_interval_seconds)?;
        unit_interval("quiet_threshold", self.quiet_threshold)?;
        unit_interval("active_threshold", self.active_threshold)?;
        if self.quiet_threshold >= self.active_threshold {
            return Err(ConfigError::ActivityThresholds {
                quiet: self.quiet_threshold,
                active: self.active_threshold,
            });
        }
        unit_interval("min_change_confidence", self.min_change_confidence)?;

        nonzero("batch_size", self.batch_size)?;
        positive("batch_timeout_seconds", self.batch_timeout_seconds)?;
        representable("batch_timeout_seconds", self.batch_timeout_seconds)?;
        if self.batch_tick_millis == 0 {
            return Err(ConfigError::Zero {
                field: "batch_tick_millis",
            });
        }

        non_negative("cost_threshold_per_hour", self.cost_threshold_per_hour)?;
        non_negative("per_call_cost_ceiling", self.per_call_cost_ceiling)?;
        unit_interval("confidence_thresholds.quiet", self.confidence_thresholds.quiet)?;
        unit_interval("confidence_thresholds.normal", self.confidence_thresholds.normal)?;
        unit_interval("confidence_thresholds.active", self.confidence_thresholds.active)?;
        self.cost_model.validate()?;

        positive("analyzer_timeout_seconds", self.analyzer_timeout_seconds)?;
        representable("analyzer_timeout_seconds", self.analyzer_timeout_seconds)?;
        nonzero("worker_count", self.worker_count)?;
        Ok(())
    }

    pub fn ttl(&self) -> Duration {
        secs(self.ttl_seconds)
    }

    pub fn fallback_ttl(&self) -> Duration {
        secs(self.fallback_ttl_seconds.min(self.ttl_seconds))
    }

    pub fn control_interval(&self) -> Duration {
        secs(self.control_interval_seconds)
    }

    pub fn batch_timeout(&self) -> Duration {
        secs(self.batch_timeout_seconds)
    }

    pub fn batch_tick(&self) -> Duration {
        Duration::from_millis(self.batch_tick_millis)
    }

    pub fn analyzer_timeout(&self) -> Duration {
        secs(self.analyzer_timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ttl(), Duration::from_secs(300));
        assert_eq!(config.max_entries, 50);
        assert_eq!(config.batch_size, 3);
        assert_eq!(config.batch_timeout(), Duration::from_secs(5));
        assert_eq!(config.min_fps, 0.2);
        assert_eq!(config.max_fps, 2.0);
    }

    #[test]
    fn test_inverted_fps_bounds_fail_fast() {
        let config = PipelineConfig {
            min_fps: 3.0,
            max_fps: 2.0,
            neutral_fps: 2.0,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::FpsBounds { min: 3.0, max: 2.0 })
        );
    }

    #[test]
    fn test_negative_ttl_is_rejected() {
        let config = PipelineConfig {
            ttl_seconds: -1.0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Negative {
                field: "ttl_seconds",
                ..
            })
        ));
    }

    #[test]
    fn test_zero_values_are_rejected() {
        let mut config = PipelineConfig::default();
        config.batch_size = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero {
                field: "batch_size"
            })
        );

        config.batch_size = 3;
        config.worker_count = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero {
                field: "worker_count"
            })
        );
    }

    #[test]
    fn test_zero_max_entries_is_allowed() {
        let config = PipelineConfig {
            max_entries: 0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_thresholds_must_be_ordered() {
        let config = PipelineConfig {
            quiet_threshold: 0.8,
            active_threshold: 0.7,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ActivityThresholds { .. })
        ));
    }

    #[test]
    fn test_unrepresentable_durations_are_rejected() {
        let config = PipelineConfig {
            analyzer_timeout_seconds: 1e20,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::DurationOutOfRange {
                field: "analyzer_timeout_seconds",
                value: 1e20
            })
        );

        let config = PipelineConfig {
            ttl_seconds: 1e20,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DurationOutOfRange {
                field: "ttl_seconds",
                ..
            })
        ));

        let config = PipelineConfig {
            min_fps: 1e-300,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DurationOutOfRange {
                field: "1 / min_fps",
                ..
            })
        ));
    }

    #[test]
    fn test_long_durations_survive_conversion() {
        let config = PipelineConfig {
            ttl_seconds: 86_400.0 * 365.0,
            analyzer_timeout_seconds: 3_600.0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.ttl(), Duration::from_secs(86_400 * 365));
        assert_eq!(config.analyzer_timeout(), Duration::from_secs(3_600));
    }

    #[test]
    fn test_fallback_ttl_never_exceeds_ttl() {
        let config = PipelineConfig {
            ttl_seconds: 30.0,
            fallback_ttl_seconds: 60.0,
            ..Default::default()
        };
        assert_eq!(config.fallback_ttl(), Duration::from_secs(30));
    }

    #[test]
    fn test_load_partial_file_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "max_entries": 10, "batch_size": 2 }}"#).unwrap();

        let config = PipelineConfig::load(file.path()).unwrap();
        assert_eq!(config.max_entries, 10);
        assert_eq!(config.batch_size, 2);
        assert_eq!(config.ttl_seconds, 300.0);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "min_fps": 5.0 }}"#).unwrap();

        let err = PipelineConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("Invalid pipeline config"));
    }
}
