use std::fmt;

use image::{DynamicImage, GrayImage};
use image_hasher::{HashAlg, HasherConfig, ImageHash};
use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};

use super::frame::Frame;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::log_debug;

const REDUCED_WIDTH: u32 = 300;
const REDUCED_HEIGHT: u32 = 200;
const PIXEL_WEIGHT: f64 = 0.5;
const HASH_WEIGHT: f64 = 0.5;

/// SHA-256 of a frame's encoded bytes. Exact-match component of the cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

/// Result of comparing one frame against the last accepted frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChangeSignal {
    pub fingerprint: Fingerprint,
    pub similarity: f64,
    /// `1 - similarity`, or 1.0 when there is nothing to compare against.
    pub change_confidence: f64,
    /// Source resolution, when the frame could be decoded.
    pub dimensions: Option<(u32, u32)>,
}

/// Small grayscale rendition of a frame plus its perceptual hash.
struct Reduction {
    gray: GrayImage,
    hash: ImageHash,
}

fn reduce(image: &DynamicImage) -> Reduction {
    let thumb = image.thumbnail_exact(REDUCED_WIDTH, REDUCED_HEIGHT);
    let hasher = HasherConfig::new()
        .hash_alg(HashAlg::DoubleGradient)
        .hash_size(8, 8)
        .to_hasher();
    let hash = hasher.hash_image(&thumb);
    Reduction {
        gray: thumb.to_luma8(),
        hash,
    }
}

fn compare(lhs: &Reduction, rhs: &Reduction) -> f64 {
    let pixels = lhs.gray.as_raw().len().min(rhs.gray.as_raw().len());
    let pixel_score = if pixels == 0 {
        0.0
    } else {
        let total: u64 = lhs
            .gray
            .as_raw()
            .iter()
            .zip(rhs.gray.as_raw())
            .map(|(a, b)| u64::from(a.abs_diff(*b)))
            .sum();
        1.0 - (total as f64 / pixels as f64) / 255.0
    };

    let bits = lhs.hash.as_bytes().len() * 8;
    let hash_score = if bits == 0 {
        0.0
    } else {
        1.0 - f64::from(lhs.hash.dist(&rhs.hash)) / bits as f64
    };

    (pixel_score * PIXEL_WEIGHT + hash_score * HASH_WEIGHT).clamp(0.0, 1.0)
}

/// A reduction together with the context it was captured in.
struct Observed {
    reduction: Reduction,
    context: String,
}

/// Fingerprints frames and scores them against the last accepted frame.
///
/// `observe` never replaces the baseline on its own; the caller decides whether
/// the frame was significant and calls `accept`. Frames judged unchanged
/// therefore keep being compared against the same baseline, so a slow drift
/// still accumulates into a visible change. A frame from a different context
/// than the baseline is always a full change, however alike the pixels are.
#[derive(Default)]
pub struct FrameHasher {
    baseline: Option<Observed>,
    pending: Option<Observed>,
}

impl FrameHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deterministic content digest. Unreadable frames hash their id instead, so
    /// they never collide with each other in the cache.
    pub fn fingerprint(frame: &Frame) -> Fingerprint {
        match frame.image.load() {
            Ok(bytes) => Fingerprint::of(&bytes),
            Err(_) => Fingerprint::of(frame.id.as_bytes()),
        }
    }

    /// Similarity in [0, 1] between two frames. Either frame being unreadable
    /// yields 0.0.
    pub fn similarity(a: &Frame, b: &Frame) -> f64 {
        match (a.image.decode(), b.image.decode()) {
            (Ok(lhs), Ok(rhs)) => compare(&reduce(&lhs), &reduce(&rhs)),
            _ => 0.0,
        }
    }

    pub fn observe(&mut self, frame: &Frame) -> ChangeSignal {
        let bytes = frame.image.load();
        let fingerprint = match &bytes {
            Ok(bytes) => Fingerprint::of(bytes),
            Err(_) => Fingerprint::of(frame.id.as_bytes()),
        };

        let decoded = bytes
            .ok()
            .and_then(|bytes| image::load_from_memory(&bytes).ok());

        let Some(image) = decoded else {
            log_debug!(
                "frame {} unreadable ({}), treating as changed",
                frame.id,
                frame.image.describe()
            );
            self.pending = None;
            return ChangeSignal {
                fingerprint,
                similarity: 0.0,
                change_confidence: 1.0,
                dimensions: None,
            };
        };

        let dimensions = Some((image.width(), image.height()));
        let current = reduce(&image);

        let (similarity, change_confidence) = match &self.baseline {
            Some(baseline) => {
                let similarity = compare(&baseline.reduction, &current);
                if baseline.context == frame.context {
                    (similarity, 1.0 - similarity)
                } else {
                    log_debug!(
                        "context switch {} -> {}, treating as changed",
                        baseline.context,
                        frame.context
                    );
                    (similarity, 1.0)
                }
            }
            None => (0.0, 1.0),
        };

        self.pending = Some(Observed {
            reduction: current,
            context: frame.context.clone(),
        });

        ChangeSignal {
            fingerprint,
            similarity,
            change_confidence,
            dimensions,
        }
    }

    /// Promote the most recently observed frame to the comparison baseline.
    pub fn accept(&mut self) {
        if let Some(pending) = self.pending.take() {
            self.baseline = Some(pending);
        }
    }

    pub fn has_baseline(&self) -> bool {
        self.baseline.is_some()
    }

    pub fn reset(&mut self) {
        self.baseline = None;
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensing::frame::ImageRef;
    use image::{ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;

    fn png(width: u32, height: u32, fill: impl Fn(u32, u32) -> [u8; 4]) -> Vec<u8> {
        let img = RgbaImage::from_fn(width, height, |x, y| Rgba(fill(x, y)));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    fn frame(bytes: Vec<u8>) -> Frame {
        Frame::new(ImageRef::encoded(bytes), "Editor")
    }

    fn stripes() -> Vec<u8> {
        png(640, 480, |x, _| if (x / 40) % 2 == 0 { [255, 255, 255, 255] } else { [0, 0, 0, 255] })
    }

    fn checker() -> Vec<u8> {
        png(640, 480, |x, y| {
            if ((x / 80) + (y / 80)) % 2 == 0 {
                [30, 30, 30, 255]
            } else {
                [220, 220, 220, 255]
            }
        })
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let a = frame(stripes());
        let b = frame(stripes());
        assert_eq!(FrameHasher::fingerprint(&a), FrameHasher::fingerprint(&b));
        assert_ne!(
            FrameHasher::fingerprint(&a),
            FrameHasher::fingerprint(&frame(checker()))
        );
        assert_eq!(FrameHasher::fingerprint(&a).to_hex().len(), 64);
    }

    #[test]
    fn identical_frames_are_fully_similar() {
        let score = FrameHasher::similarity(&frame(stripes()), &frame(stripes()));
        assert!((score - 1.0).abs() < 1e-9, "score was {score}");
    }

    #[test]
    fn different_frames_score_lower() {
        let score = FrameHasher::similarity(&frame(stripes()), &frame(checker()));
        assert!(score < 0.9, "score was {score}");
    }

    #[test]
    fn unreadable_frame_scores_zero() {
        let broken = frame(vec![1, 2, 3]);
        assert_eq!(FrameHasher::similarity(&broken, &frame(stripes())), 0.0);
    }

    #[test]
    fn first_observation_is_full_change() {
        let mut hasher = FrameHasher::new();
        let signal = hasher.observe(&frame(stripes()));
        assert_eq!(signal.change_confidence, 1.0);
        assert_eq!(signal.dimensions, Some((640, 480)));
    }

    #[test]
    fn repeat_after_accept_is_unchanged() {
        let mut hasher = FrameHasher::new();
        hasher.observe(&frame(stripes()));
        hasher.accept();

        let signal = hasher.observe(&frame(stripes()));
        assert!(signal.similarity > 0.999);
        assert!(signal.change_confidence < 0.001);
    }

    #[test]
    fn unaccepted_frames_do_not_move_baseline() {
        let mut hasher = FrameHasher::new();
        hasher.observe(&frame(stripes()));
        hasher.accept();

        hasher.observe(&frame(checker()));
        let signal = hasher.observe(&frame(stripes()));
        assert!(signal.change_confidence < 0.001);
    }

    #[test]
    fn context_switch_is_full_change() {
        let mut hasher = FrameHasher::new();
        hasher.observe(&frame(stripes()));
        hasher.accept();

        let moved = Frame::new(ImageRef::encoded(stripes()), "Browser");
        let signal = hasher.observe(&moved);
        assert!(signal.similarity > 0.999);
        assert_eq!(signal.change_confidence, 1.0);

        // Accepting the switch makes the new context the baseline.
        hasher.accept();
        let signal = hasher.observe(&moved);
        assert!(signal.change_confidence < 0.001);
    }

    #[test]
    fn unreadable_frame_keeps_baseline() {
        let mut hasher = FrameHasher::new();
        hasher.observe(&frame(stripes()));
        hasher.accept();

        let broken = hasher.observe(&frame(vec![0; 8]));
        assert_eq!(broken.similarity, 0.0);
        assert_eq!(broken.change_confidence, 1.0);
        hasher.accept();
        assert!(hasher.has_baseline());
    }
}
