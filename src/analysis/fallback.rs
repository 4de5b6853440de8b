use image::GrayImage;

use crate::error::FallbackError;

use super::{AnalysisRequest, AnalyzerOutput, FallbackAnalyzer};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::log_debug;

const SAMPLE_WIDTH: u32 = 320;
const SAMPLE_HEIGHT: u32 = 200;
/// Horizontal luma jump that counts as an edge.
const EDGE_DIFF: i16 = 25;
/// Fraction of a row that must be edges for the row to look like text.
const TEXT_ROW_FRACTION: f64 = 0.05;
const BLANK_EDGE_DENSITY: f64 = 0.01;
const TEXT_HEAVY_ROWS: f64 = 0.25;
const BUSY_EDGE_DENSITY: f64 = 0.15;

pub const FALLBACK_CONFIDENCE: f64 = 0.55;
pub const CONTEXT_ONLY_CONFIDENCE: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScreenFeatures {
    pub edge_density: f64,
    pub text_rows: f64,
    pub mean_luma: f64,
}

/// Edge density and text-line likeness of a grayscale image.
pub fn measure(gray: &GrayImage) -> ScreenFeatures {
    let (w, h) = (gray.width() as usize, gray.height() as usize);
    if w < 3 || h == 0 {
        return ScreenFeatures {
            edge_density: 0.0,
            text_rows: 0.0,
            mean_luma: 0.0,
        };
    }

    let pixels = gray.as_raw();
    let line_threshold = (w as f64 * TEXT_ROW_FRACTION) as usize;
    let mut edges = 0usize;
    let mut text_rows = 0usize;

    for y in 0..h {
        let row = &pixels[y * w..(y + 1) * w];
        let row_edges = row
            .windows(3)
            .filter(|px| (px[2] as i16 - px[0] as i16).abs() > EDGE_DIFF)
            .count();
        edges += row_edges;
        if row_edges > line_threshold {
            text_rows += 1;
        }
    }

    let luma: u64 = pixels.iter().map(|&p| u64::from(p)).sum();
    ScreenFeatures {
        edge_density: edges as f64 / ((w - 2) * h) as f64,
        text_rows: text_rows as f64 / h as f64,
        mean_luma: luma as f64 / pixels.len() as f64,
    }
}

pub fn describe(features: &ScreenFeatures, context: &str) -> String {
    let tone = if features.mean_luma > 160.0 {
        "light"
    } else if features.mean_luma < 80.0 {
        "dark"
    } else {
        "mid-tone"
    };
    let layout = if features.edge_density < BLANK_EDGE_DENSITY {
        "mostly blank or static"
    } else if features.text_rows > TEXT_HEAVY_ROWS {
        "text-heavy"
    } else if features.edge_density > BUSY_EDGE_DENSITY {
        "graphical and visually busy"
    } else {
        "a mix of text and graphics"
    };
    format!("{context}: {layout} {tone} screen")
}

/// Local description from image statistics alone. Fast and offline, so its
/// results carry lower confidence than the primary analyzer's.
#[derive(Debug, Clone, Default)]
pub struct HeuristicFallback;

impl HeuristicFallback {
    pub fn new() -> Self {
        Self
    }

    fn label(context: &str) -> Option<&str> {
        let trimmed = context.trim();
        if trimmed.is_empty() || trimmed == "unknown" {
            None
        } else {
            Some(trimmed)
        }
    }
}

impl FallbackAnalyzer for HeuristicFallback {
    fn analyze(&self, request: &AnalysisRequest) -> Result<AnalyzerOutput, FallbackError> {
        let image = match request.primary.decode() {
            Ok(image) => image,
            Err(err) => {
                let Some(label) = Self::label(&request.context) else {
                    return Err(FallbackError::Frame(err));
                };
                log_debug!(
                    "fallback could not decode {} ({err}); describing from context only",
                    request.primary.describe()
                );
                return Ok(AnalyzerOutput {
                    text: format!("{label}: screen contents unavailable"),
                    confidence: Some(CONTEXT_ONLY_CONFIDENCE),
                });
            }
        };

        if image.width() == 0 || image.height() == 0 {
            return Err(FallbackError::NoContent(format!(
                "frame {} has no pixels",
                request.frame_id
            )));
        }

        let gray = image.thumbnail(SAMPLE_WIDTH, SAMPLE_HEIGHT).to_luma8();
        let features = measure(&gray);
        let context = Self::label(&request.context).unwrap_or("Screen");
        let mut text = describe(&features, context);
        if !request.batch_context.is_empty() {
            text.push_str(&format!(
                " ({} related change(s) in this burst)",
                request.batch_context.len()
            ));
        }

        Ok(AnalyzerOutput {
            text,
            confidence: Some(FALLBACK_CONFIDENCE),
        })
    }
}
