//! Evidence artifacts written from a capture session.
//!
//! Photos are single JPEG files. Videos are Motion-JPEG streams (JPEG frames
//! back to back), which common players open directly. Files are written under
//! a temporary name and renamed into place, so a half-written artifact never
//! carries a final name.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::{CaptureDevice, CaptureMode, CaptureSession, Frame};
use crate::error::GuardError;

const JPEG_QUALITY: u8 = 85;

/// Extension carried by artifacts that are still being written.
pub const PARTIAL_EXTENSION: &str = "partial";

static ARTIFACT_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArtifactKind {
    Photo,
    Video,
}

impl ArtifactKind {
    fn prefix(self) -> &'static str {
        match self {
            ArtifactKind::Photo => "intrusion_photo",
            ArtifactKind::Video => "intrusion_video",
        }
    }

    fn extension(self) -> &'static str {
        match self {
            ArtifactKind::Photo => "jpg",
            ArtifactKind::Video => "mjpeg",
        }
    }
}

/// Captures from `device` into a new artifact under `media_dir`.
///
/// The device session is closed on every path. A video that yields no frames
/// is a failure and leaves no file behind.
pub fn capture_to_artifact(
    device: &dyn CaptureDevice,
    mode: CaptureMode,
    media_dir: &Path,
) -> Result<PathBuf> {
    fs::create_dir_all(media_dir)
        .with_context(|| format!("create media dir {}", media_dir.display()))?;

    let mut session = device.open()?;
    let result = match mode {
        CaptureMode::Photo => write_photo(session.as_mut(), media_dir),
        CaptureMode::Video { duration } => {
            let frames = video_frame_budget(duration, device.nominal_fps());
            write_video(session.as_mut(), media_dir, frames)
        }
    };
    session.close();
    result
}

/// Frames needed to cover `duration` at `fps`, rounded up. At least one.
fn video_frame_budget(duration: Duration, fps: u32) -> u64 {
    let fps = f64::from(fps.max(1));
    let frames = (duration.as_secs_f64() * fps).ceil();
    if frames >= u64::MAX as f64 {
        return u64::MAX;
    }
    (frames as u64).max(1)
}

fn artifact_path(media_dir: &Path, kind: ArtifactKind) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let seq = ARTIFACT_SEQ.fetch_add(1, Ordering::Relaxed);
    media_dir.join(format!(
        "{}_{}_{}.{}",
        kind.prefix(),
        stamp,
        seq,
        kind.extension()
    ))
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".");
    tmp.push(PARTIAL_EXTENSION);
    PathBuf::from(tmp)
}

fn encode_jpeg(out: &mut impl Write, frame: &Frame) -> Result<()> {
    if !frame.is_well_formed() {
        return Err(GuardError::device(format!(
            "malformed frame: {}x{} with {} bytes",
            frame.width,
            frame.height,
            frame.pixels.len()
        ))
        .into());
    }
    let mut encoder = JpegEncoder::new_with_quality(out, JPEG_QUALITY);
    encoder.encode(&frame.pixels, frame.width, frame.height, ExtendedColorType::Rgb8)?;
    Ok(())
}

fn write_photo(session: &mut dyn CaptureSession, media_dir: &Path) -> Result<PathBuf> {
    let frame = session
        .read_frame()?
        .ok_or_else(|| GuardError::device("device returned no frame for photo"))?;
    let path = artifact_path(media_dir, ArtifactKind::Photo);
    let tmp = temp_path_for(&path);
    let written = (|| -> Result<()> {
        let mut out = BufWriter::new(File::create(&tmp)?);
        encode_jpeg(&mut out, &frame)?;
        out.flush()?;
        Ok(())
    })();
    finish(written, &tmp, &path)
}

fn write_video(
    session: &mut dyn CaptureSession,
    media_dir: &Path,
    max_frames: u64,
) -> Result<PathBuf> {
    let path = artifact_path(media_dir, ArtifactKind::Video);
    let tmp = temp_path_for(&path);
    let written = (|| -> Result<()> {
        let mut out = BufWriter::new(File::create(&tmp)?);
        let mut captured = 0u64;
        while captured < max_frames {
            match session.read_frame()? {
                Some(frame) => {
                    encode_jpeg(&mut out, &frame)?;
                    captured += 1;
                }
                None => break,
            }
        }
        out.flush()?;
        if captured == 0 {
            return Err(GuardError::device("no frames captured for video").into());
        }
        log::debug!("captured {} video frames", captured);
        Ok(())
    })();
    finish(written, &tmp, &path)
}

fn finish(written: Result<()>, tmp: &Path, path: &Path) -> Result<PathBuf> {
    if let Err(e) = written {
        discard(tmp);
        return Err(e);
    }
    fs::rename(tmp, path).map_err(|e| {
        discard(tmp);
        anyhow!("failed to finalize artifact {}: {}", path.display(), e)
    })?;
    Ok(path.to_path_buf())
}

fn discard(tmp: &Path) {
    match fs::remove_file(tmp) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("failed to remove partial artifact {}: {}", tmp.display(), e),
    }
}
