use anyhow::Result;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{CaptureDevice, CaptureSession, Frame};
use crate::error::GuardError;

#[derive(Clone, Debug)]
pub struct SyntheticCameraConfig {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// End of stream after this many frames per session.
    pub frames_per_session: Option<u64>,
    /// Delay before `open` returns, to simulate slow hardware.
    pub open_delay: Duration,
}

impl Default for SyntheticCameraConfig {
    fn default() -> Self {
        Self {
            device: "stub://camera0".to_string(),
            width: 64,
            height: 48,
            fps: 5,
            frames_per_session: None,
            open_delay: Duration::ZERO,
        }
    }
}

/// Synthetic camera for `stub://` devices.
///
/// Produces a moving gradient and supports fault injection: the device can be
/// made unreachable, can refuse to open, or can end its stream early.
pub struct SyntheticCamera {
    config: SyntheticCameraConfig,
    reachable: AtomicBool,
    fail_open: AtomicBool,
    frames_per_session: Arc<AtomicU64>,
    opens: AtomicU64,
    open_sessions: Arc<AtomicU64>,
}

const UNLIMITED: u64 = u64::MAX;

impl SyntheticCamera {
    pub fn new(config: SyntheticCameraConfig) -> Self {
        let frames = config.frames_per_session.unwrap_or(UNLIMITED);
        Self {
            config,
            reachable: AtomicBool::new(true),
            fail_open: AtomicBool::new(false),
            frames_per_session: Arc::new(AtomicU64::new(frames)),
            opens: AtomicU64::new(0),
            open_sessions: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn set_frames_per_session(&self, frames: Option<u64>) {
        self.frames_per_session
            .store(frames.unwrap_or(UNLIMITED), Ordering::SeqCst);
    }

    /// Number of successful `open` calls so far.
    pub fn open_count(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }

    /// Sessions opened but not yet closed or dropped.
    pub fn sessions_in_flight(&self) -> u64 {
        self.open_sessions.load(Ordering::SeqCst)
    }
}

impl CaptureDevice for SyntheticCamera {
    fn device_id(&self) -> &str {
        &self.config.device
    }

    fn open(&self) -> Result<Box<dyn CaptureSession>> {
        if !self.config.open_delay.is_zero() {
            std::thread::sleep(self.config.open_delay);
        }
        if self.fail_open.load(Ordering::SeqCst) || !self.reachable.load(Ordering::SeqCst) {
            return Err(GuardError::device(format!("cannot open {}", self.config.device)).into());
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.open_sessions.fetch_add(1, Ordering::SeqCst);
        log::debug!("SyntheticCamera: opened {}", self.config.device);
        Ok(Box::new(SyntheticSession {
            width: self.config.width,
            height: self.config.height,
            limit: self.frames_per_session.load(Ordering::SeqCst),
            frame_count: 0,
            open_sessions: self.open_sessions.clone(),
            closed: false,
        }))
    }

    fn probe_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    fn nominal_fps(&self) -> u32 {
        self.config.fps
    }
}

struct SyntheticSession {
    width: u32,
    height: u32,
    limit: u64,
    frame_count: u64,
    open_sessions: Arc<AtomicU64>,
    closed: bool,
}

impl SyntheticSession {
    fn generate_pixels(&self) -> Vec<u8> {
        let pixel_count = (self.width * self.height * 3) as usize;
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count * 7) % 256) as u8;
        }
        pixels
    }
}

impl CaptureSession for SyntheticSession {
    fn read_frame(&mut self) -> Result<Option<Frame>> {
        if self.closed || self.frame_count >= self.limit {
            return Ok(None);
        }
        self.frame_count += 1;
        Ok(Some(Frame {
            width: self.width,
            height: self.height,
            pixels: self.generate_pixels(),
        }))
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.open_sessions.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for SyntheticSession {
    fn drop(&mut self) {
        self.close();
    }
}
