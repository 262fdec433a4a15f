//! Screen captures, reference comparison and the stability retry policy

mod capture;
mod stability;

pub(crate) use capture::discard;
pub use capture::{capture_name, convert_dump, load_reference, Frame, ScreenCapture, ScreenMatch};
pub use stability::{
    attempt_path, capture_stable, CapturePolicy, FrameGrabber, PolicyCapture, StabilityConfig,
};

#[cfg(test)]
pub(crate) use stability::tests::ScriptedGrabber;
