//! Capture-until-stable matcher
//!
//! Some cams redraw their display asynchronously, and a single screendump can
//! catch a half-drawn frame. For those, several frames are grabbed and the
//! first one seen twice is taken as the real screen.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::capture::{discard, Frame, ScreenCapture};
use crate::common::Result;

/// Something that can dump the current screen to an image file
#[async_trait]
pub trait FrameGrabber: Send {
    /// Grab one frame and store it as PNG at `dest`, overwriting it
    async fn grab_frame(&mut self, dest: &Path) -> Result<()>;
}

/// Retry parameters for unstable displays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StabilityConfig {
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_delay: Duration::from_millis(200),
        }
    }
}

/// How a session turns a capture request into a canonical capture file
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CapturePolicy {
    /// One grab straight into the slot
    #[default]
    Direct,
    /// Grab until two frames agree
    Stabilized(StabilityConfig),
}

/// Outcome of one capture through a policy
#[derive(Debug)]
pub struct PolicyCapture {
    pub capture: ScreenCapture,
    /// Frames grabbed to produce this capture
    pub grabs: u32,
    /// False only when a stabilized capture ran out of attempts
    pub stabilized: bool,
    /// Attempt files kept on disk for diagnosis
    pub retained: Vec<PathBuf>,
}

impl CapturePolicy {
    /// Capture into `slot`, which afterwards always holds the chosen frame
    pub async fn capture<G: FrameGrabber + ?Sized>(
        &self,
        grabber: &mut G,
        slot: &Path,
        name: &str,
        seq: u64,
    ) -> Result<PolicyCapture> {
        match self {
            CapturePolicy::Direct => {
                grabber.grab_frame(slot).await?;
                Ok(PolicyCapture {
                    capture: ScreenCapture::load(slot, name, seq).await?,
                    grabs: 1,
                    stabilized: true,
                    retained: Vec::new(),
                })
            }
            CapturePolicy::Stabilized(config) => {
                capture_stable(grabber, slot, name, seq, config).await
            }
        }
    }
}

/// File an individual attempt is grabbed into
pub fn attempt_path(slot: &Path, attempt: u32) -> PathBuf {
    let stem = slot
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    slot.with_file_name(format!("{}.try{}.png", stem, attempt))
}

/// Grab until some frame repeats, or `max_attempts` frames were grabbed
///
/// On a repeat the repeating attempt becomes the slot and every other attempt
/// is deleted. Without a repeat the last attempt is copied into the slot and
/// all attempts are kept.
pub async fn capture_stable<G: FrameGrabber + ?Sized>(
    grabber: &mut G,
    slot: &Path,
    name: &str,
    seq: u64,
    config: &StabilityConfig,
) -> Result<PolicyCapture> {
    let max_attempts = config.max_attempts.max(1);
    let mut seen: Vec<(PathBuf, String)> = Vec::with_capacity(max_attempts as usize);
    let mut last_frame: Option<Frame> = None;

    for attempt in 1..=max_attempts {
        if attempt > 1 {
            tokio::time::sleep(config.retry_delay).await;
        }

        let path = attempt_path(slot, attempt);
        grabber.grab_frame(&path).await?;
        let frame = Frame::load(&path).await?;
        let hash = frame.content_hash();

        if seen.iter().any(|(_, h)| *h == hash) {
            for (other, _) in &seen {
                discard(other).await?;
            }
            tokio::fs::rename(&path, slot).await?;
            tracing::debug!("{} stable after {} grabs", name, attempt);
            return Ok(PolicyCapture {
                capture: ScreenCapture::new(name.to_string(), slot.to_path_buf(), seq, frame),
                grabs: attempt,
                stabilized: true,
                retained: Vec::new(),
            });
        }

        seen.push((path, hash));
        last_frame = Some(frame);
    }

    // Best effort: the last grab, which may well fail comparison later
    let (last_path, _) = seen
        .last()
        .ok_or_else(|| crate::common::Error::Internal("no capture attempts made".into()))?;
    tokio::fs::copy(last_path, slot).await?;
    let frame = last_frame
        .ok_or_else(|| crate::common::Error::Internal("no capture attempts made".into()))?;

    tracing::warn!(
        "{} never stabilized in {} grabs, keeping all attempts",
        name,
        max_attempts
    );

    Ok(PolicyCapture {
        capture: ScreenCapture::new(name.to_string(), slot.to_path_buf(), seq, frame),
        grabs: max_attempts,
        stabilized: false,
        retained: seen.into_iter().map(|(p, _)| p).collect(),
    })
}
