//! Capture device abstraction.
//!
//! This module provides the device seam used by the blocking engine (for
//! reachability probes) and by the intrusion pipeline (for evidence):
//! - `SyntheticCamera`: deterministic frames for `stub://` devices and tests
//! - `V4l2Camera`: local V4L2 devices (feature: capture-v4l2)
//!
//! Sessions are opened per capture and closed on every exit path. Turning
//! frames into stored artifacts is the job of [`artifact`].

use anyhow::Result;
use std::time::Duration;

pub mod artifact;
mod synthetic;
#[cfg(feature = "capture-v4l2")]
pub mod v4l2;

pub use artifact::{capture_to_artifact, ArtifactKind, PARTIAL_EXTENSION};
pub use synthetic::{SyntheticCamera, SyntheticCameraConfig};
#[cfg(feature = "capture-v4l2")]
pub use v4l2::{V4l2Camera, V4l2Config};

/// One RGB8 frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Frame {
    pub fn is_well_formed(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.pixels.len() == (self.width as usize) * (self.height as usize) * 3
    }
}

/// What to record when evidence is captured.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureMode {
    Photo,
    Video { duration: Duration },
}

pub trait CaptureDevice: Send + Sync {
    fn device_id(&self) -> &str;

    /// Opens a capture session. Fails with a `DeviceUnavailable` error when
    /// the device cannot be opened.
    fn open(&self) -> Result<Box<dyn CaptureSession>>;

    /// Cheap reachability check: open at low resolution and read one frame.
    fn probe_reachable(&self) -> bool;

    /// Frame rate used to size duration-bounded captures.
    fn nominal_fps(&self) -> u32;
}

/// A session lives on the thread that opened it.
pub trait CaptureSession {
    /// `Ok(None)` marks end of stream.
    fn read_frame(&mut self) -> Result<Option<Frame>>;

    fn close(&mut self) {}
}
