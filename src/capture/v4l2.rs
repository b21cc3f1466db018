//! Local V4L2 capture devices (e.g. `/dev/video0`).
//!
//! Frames are requested as packed RGB (`RGB3`). Devices that refuse the format
//! are reported unavailable rather than producing undecodable evidence.

use anyhow::{Context, Result};
use ouroboros::self_referencing;

use super::{CaptureDevice, CaptureSession, Frame};
use crate::error::GuardError;

const PROBE_WIDTH: u32 = 320;
const PROBE_HEIGHT: u32 = 240;
const STREAM_BUFFERS: u32 = 4;

#[derive(Clone, Debug)]
pub struct V4l2Config {
    pub device: String,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for V4l2Config {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            fps: 20,
            width: 640,
            height: 480,
        }
    }
}

pub struct V4l2Camera {
    config: V4l2Config,
}

impl V4l2Camera {
    pub fn new(config: V4l2Config) -> Self {
        Self { config }
    }

    fn open_at(&self, width: u32, height: u32) -> Result<V4l2Session> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(&self.config.device)
            .with_context(|| format!("open v4l2 device {}", self.config.device))
            .map_err(|e| GuardError::device(format!("{:#}", e)))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = width;
        format.height = height;
        format.fourcc = v4l::FourCC::new(b"RGB3");
        let format = device
            .set_format(&format)
            .with_context(|| format!("set RGB3 format on {}", self.config.device))?;
        if format.fourcc != v4l::FourCC::new(b"RGB3") {
            return Err(GuardError::device(format!(
                "{} does not support RGB3 capture",
                self.config.device
            ))
            .into());
        }

        if self.config.fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.config.fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!("V4l2Camera: failed to set fps on {}: {}", self.config.device, err);
            }
        }

        let state = V4l2StreamBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, STREAM_BUFFERS)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;

        log::debug!(
            "V4l2Camera: opened {} ({}x{})",
            self.config.device,
            format.width,
            format.height
        );
        Ok(V4l2Session {
            state: Some(state),
            width: format.width,
            height: format.height,
        })
    }
}

impl CaptureDevice for V4l2Camera {
    fn device_id(&self) -> &str {
        &self.config.device
    }

    fn open(&self) -> Result<Box<dyn CaptureSession>> {
        let session = self.open_at(self.config.width, self.config.height)?;
        Ok(Box::new(session))
    }

    fn probe_reachable(&self) -> bool {
        match self.open_at(PROBE_WIDTH, PROBE_HEIGHT) {
            Ok(mut session) => {
                let ok = matches!(session.read_frame(), Ok(Some(_)));
                session.close();
                ok
            }
            Err(e) => {
                log::debug!("V4l2Camera: {} not reachable: {:#}", self.config.device, e);
                false
            }
        }
    }

    fn nominal_fps(&self) -> u32 {
        self.config.fps
    }
}

#[self_referencing]
struct V4l2Stream {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

struct V4l2Session {
    state: Option<V4l2Stream>,
    width: u32,
    height: u32,
}

impl CaptureSession for V4l2Session {
    fn read_frame(&mut self) -> Result<Option<Frame>> {
        use v4l::io::traits::CaptureStream;

        let Some(state) = self.state.as_mut() else {
            return Ok(None);
        };
        let pixels = state
            .with_mut(|fields| fields.stream.next().map(|(buf, _meta)| buf.to_vec()))
            .map_err(|err| GuardError::device(format!("capture v4l2 frame: {}", err)))?;
        let frame = Frame {
            width: self.width,
            height: self.height,
            pixels,
        };
        if !frame.is_well_formed() {
            return Err(GuardError::device(format!(
                "v4l2 frame has {} bytes for {}x{} RGB",
                frame.pixels.len(),
                frame.width,
                frame.height
            ))
            .into());
        }
        Ok(Some(frame))
    }

    fn close(&mut self) {
        self.state = None;
    }
}
