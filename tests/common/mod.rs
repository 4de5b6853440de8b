#![allow(dead_code)]

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use screenwise_lib::{
    AnalysisRequest, Analyzer, AnalyzerError, AnalyzerOutput, FallbackAnalyzer, FallbackError,
    Frame, ImageRef,
};

fn encode(img: GrayImage) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageLuma8(img)
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

/// Vertical stripes `period` pixels wide.
pub fn stripes(period: u32) -> Vec<u8> {
    encode(GrayImage::from_fn(160, 120, |x, _| {
        if (x / period) % 2 == 0 {
            Luma([20])
        } else {
            Luma([235])
        }
    }))
}

/// Checkerboard with `cell`-pixel squares.
pub fn checker(cell: u32) -> Vec<u8> {
    encode(GrayImage::from_fn(160, 120, |x, y| {
        if ((x / cell) + (y / cell)) % 2 == 0 {
            Luma([10])
        } else {
            Luma([245])
        }
    }))
}

/// Horizontal gradient, brightening left to right or the reverse.
pub fn gradient(reverse: bool) -> Vec<u8> {
    encode(GrayImage::from_fn(160, 120, |x, _| {
        let v = (x * 255 / 159) as u8;
        Luma([if reverse { 255 - v } else { v }])
    }))
}

pub fn frame(bytes: &[u8], context: &str) -> Frame {
    Frame::new(ImageRef::encoded(bytes.to_vec()), context)
}

/// Analyzer with a scripted reply and optional delay. Counts its calls and
/// records when each one started and finished.
pub struct ScriptedAnalyzer {
    pub reply: Result<String, String>,
    pub delay: Option<Duration>,
    pub calls: AtomicUsize,
    pub completed: AtomicUsize,
    pub spans: Mutex<Vec<(Instant, Instant)>>,
}

impl ScriptedAnalyzer {
    pub fn ok(text: &str) -> Self {
        Self {
            reply: Ok(text.to_string()),
            delay: None,
            calls: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            spans: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            reply: Err(message.to_string()),
            delay: None,
            calls: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            spans: Mutex::new(Vec::new()),
        }
    }

    pub fn slow(text: &str, delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::ok(text)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// True when at least two recorded calls were in flight at the same time.
    pub fn overlapped(&self) -> bool {
        let spans = self.spans.lock().unwrap();
        spans.iter().enumerate().any(|(i, (start, end))| {
            spans[i + 1..]
                .iter()
                .any(|(other_start, other_end)| start < other_end && other_start < end)
        })
    }
}

#[async_trait]
impl Analyzer for ScriptedAnalyzer {
    async fn analyze(&self, _request: &AnalysisRequest) -> Result<AnalyzerOutput, AnalyzerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.spans.lock().unwrap().push((started, Instant::now()));
        self.completed.fetch_add(1, Ordering::SeqCst);
        match &self.reply {
            Ok(text) => Ok(AnalyzerOutput {
                text: text.clone(),
                confidence: Some(0.9),
            }),
            Err(message) => Err(AnalyzerError::Provider(message.clone())),
        }
    }
}

pub struct BrokenFallback;

impl FallbackAnalyzer for BrokenFallback {
    fn analyze(&self, _request: &AnalysisRequest) -> Result<AnalyzerOutput, FallbackError> {
        Err(FallbackError::NoContent("nothing recognisable".into()))
    }
}
