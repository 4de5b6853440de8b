use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::frame::{Frame, ImageRef};

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// Where the capture loop gets its frames. `Ok(None)` means the source is
/// exhausted and the loop should end.
#[async_trait]
pub trait CaptureSource: Send {
    async fn next_frame(&mut self) -> Result<Option<Frame>>;
}

/// Replays image files from a directory in file-name order.
///
/// The context label is the part of the file stem before `__`, so
/// `Editor__0001.png` is labelled `Editor`. Files without a separator are
/// labelled `unknown`.
pub struct DirectorySource {
    files: VecDeque<PathBuf>,
}

impl DirectorySource {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read frame directory {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && is_image(path))
            .collect();
        files.sort();
        Ok(Self {
            files: files.into(),
        })
    }

    pub fn remaining(&self) -> usize {
        self.files.len()
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}

pub fn context_label(path: &Path) -> String {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .and_then(|stem| stem.split_once("__"))
        .map(|(label, _)| label.trim())
        .filter(|label| !label.is_empty())
        .unwrap_or("unknown")
        .to_string()
}

#[async_trait]
impl CaptureSource for DirectorySource {
    async fn next_frame(&mut self) -> Result<Option<Frame>> {
        Ok(self.files.pop_front().map(|path| {
            let context = context_label(&path);
            Frame::new(ImageRef::Path(path), context)
        }))
    }
}

/// Frames handed over up front. Used by embedders and tests.
#[derive(Default)]
pub struct MemorySource {
    frames: VecDeque<Frame>,
}

impl MemorySource {
    pub fn new(frames: impl IntoIterator<Item = Frame>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
        }
    }

    pub fn push(&mut self, frame: Frame) {
        self.frames.push_back(frame);
    }
}

#[async_trait]
impl CaptureSource for MemorySource {
    async fn next_frame(&mut self) -> Result<Option<Frame>> {
        Ok(self.frames.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn context_comes_from_the_stem_prefix() {
        assert_eq!(context_label(Path::new("/tmp/Editor__0001.png")), "Editor");
        assert_eq!(context_label(Path::new("Web Browser__a.jpg")), "Web Browser");
        assert_eq!(context_label(Path::new("frame-7.png")), "unknown");
        assert_eq!(context_label(Path::new("__7.png")), "unknown");
    }

    #[tokio::test]
    async fn directory_source_replays_images_in_order() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("Editor__0002.png"), b"x").unwrap();
        std::fs::write(dir.path().join("Editor__0001.PNG"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let mut source = DirectorySource::open(dir.path()).unwrap();
        assert_eq!(source.remaining(), 2);

        let first = source.next_frame().await.unwrap().unwrap();
        assert_eq!(first.context, "Editor");
        assert!(first.image.describe().contains("0001"));
        assert!(source.next_frame().await.unwrap().is_some());
        assert!(source.next_frame().await.unwrap().is_none());
    }

    #[test]
    fn missing_directory_is_an_error() {
        assert!(DirectorySource::open("/definitely/not/here").is_err());
    }
}
