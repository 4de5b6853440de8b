use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Invalid configuration. Always fatal at startup; values are never clamped.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be a finite, non-negative number (got {value})")]
    Negative { field: &'static str, value: f64 },
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("{field} must lie within [0, 1] (got {value})")]
    OutsideUnitInterval { field: &'static str, value: f64 },
    #[error("min_fps ({min}) must not exceed max_fps ({max})")]
    FpsBounds { min: f64, max: f64 },
    #[error("neutral_fps ({neutral}) must lie within [{min}, {max}]")]
    NeutralFps { neutral: f64, min: f64, max: f64 },
    #[error("quiet_threshold ({quiet}) must be below active_threshold ({active})")]
    ActivityThresholds { quiet: f64, active: f64 },
    #[error("{field} ({value}s) is too long to represent as a duration")]
    DurationOutOfRange { field: &'static str, value: f64 },
}

/// A frame image that could not be read or decoded.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("failed to read frame image {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode frame image: {0}")]
    Decode(#[from] image::ImageError),
}

/// Failure of the expensive analysis provider. Always recovered by the fallback path.
#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("analyzer timed out after {0:?}")]
    Timeout(Duration),
    #[error("analyzer provider error: {0}")]
    Provider(String),
    #[error("analyzer returned an invalid response: {0}")]
    InvalidResponse(String),
    #[error("analyzer request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

#[derive(Debug, Error)]
pub enum FallbackError {
    #[error("fallback could not read the frame: {0}")]
    Frame(#[from] FrameError),
    #[error("fallback has nothing to describe: {0}")]
    NoContent(String),
}
