use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use image::DynamicImage;
use uuid::Uuid;

use crate::error::FrameError;

/// Where a frame's image bytes live. The pipeline never captures; it only reads.
#[derive(Debug, Clone)]
pub enum ImageRef {
    Path(PathBuf),
    Encoded(Arc<Vec<u8>>),
}

impl ImageRef {
    pub fn encoded(bytes: Vec<u8>) -> Self {
        ImageRef::Encoded(Arc::new(bytes))
    }

    pub fn load(&self) -> Result<Arc<Vec<u8>>, FrameError> {
        match self {
            ImageRef::Encoded(bytes) => Ok(Arc::clone(bytes)),
            ImageRef::Path(path) => fs::read(path)
                .map(Arc::new)
                .map_err(|source| FrameError::Io {
                    path: path.clone(),
                    source,
                }),
        }
    }

    pub fn decode(&self) -> Result<DynamicImage, FrameError> {
        let bytes = self.load()?;
        Ok(image::load_from_memory(&bytes)?)
    }

    pub fn describe(&self) -> String {
        match self {
            ImageRef::Path(path) => path.display().to_string(),
            ImageRef::Encoded(bytes) => format!("<{} encoded bytes>", bytes.len()),
        }
    }
}

/// One captured screen image. Immutable once created.
#[derive(Debug, Clone)]
pub struct Frame {
    pub id: Uuid,
    pub image: ImageRef,
    pub captured_at: DateTime<Utc>,
    /// Opaque label from the active-window detector, e.g. the application name.
    pub context: String,
}

impl Frame {
    pub fn new(image: ImageRef, context: impl Into<String>) -> Self {
        Self::with_timestamp(image, context, Utc::now())
    }

    pub fn with_timestamp(
        image: ImageRef,
        context: impl Into<String>,
        captured_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            image,
            captured_at,
            context: context.into(),
        }
    }
}
