pub mod activity;
pub mod controller;
pub mod frame;
pub mod hasher;
pub mod loop_worker;
pub mod source;

pub use activity::{
    ActivityBand, ActivityController, ActivityReader, ActivitySettings, ActivitySnapshot,
};
pub use controller::PipelineController;
pub use frame::{Frame, ImageRef};
pub use hasher::{ChangeSignal, Fingerprint, FrameHasher};
pub use source::{CaptureSource, DirectorySource, MemorySource};
