//! Screen capture representation
//!
//! The emulator dumps raw PPM frames. Those are converted to PNG right away
//! (PPM is several MB per frame for some cams) and compared by decoded RGB
//! pixels, so PNG encoder details never affect a comparison.

use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};

use crate::common::{Error, Result};

/// Decoded RGB8 pixels of one screen
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Frame {
    /// Decode any supported image file into RGB8
    pub fn open(path: &Path) -> Result<Self> {
        let img = image::open(path)?.to_rgb8();
        Ok(Self::from_rgb(img))
    }

    /// Same as [`Frame::open`], decoded on the blocking pool
    pub async fn load(path: &Path) -> Result<Self> {
        let path = path.to_path_buf();
        blocking(move || Self::open(&path)).await
    }

    pub fn from_rgb(img: image::RgbImage) -> Self {
        let (width, height) = img.dimensions();
        Self {
            width,
            height,
            pixels: img.into_raw(),
        }
    }

    /// SHA-256 over dimensions and pixels, hex encoded
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.width.to_le_bytes());
        hasher.update(self.height.to_le_bytes());
        hasher.update(&self.pixels);
        hex::encode(hasher.finalize())
    }

    /// Byte-exact comparison, dimensions included
    pub fn same_pixels(&self, other: &Frame) -> bool {
        self.width == other.width && self.height == other.height && self.pixels == other.pixels
    }
}

/// One capture taken during a session
#[derive(Debug, Clone)]
pub struct ScreenCapture {
    /// Canonical name, e.g. `menu_test_003.png`
    pub name: String,
    pub path: PathBuf,
    /// Position in the session's capture sequence, starting at 1
    pub seq: u64,
    pub frame: Frame,
    pub hash: String,
}

impl ScreenCapture {
    pub fn new(name: String, path: PathBuf, seq: u64, frame: Frame) -> Self {
        let hash = frame.content_hash();
        Self {
            name,
            path,
            seq,
            frame,
            hash,
        }
    }

    /// Load a capture already written to `path`
    pub async fn load(path: &Path, name: &str, seq: u64) -> Result<Self> {
        let frame = Frame::load(path).await?;
        Ok(Self::new(name.to_string(), path.to_path_buf(), seq, frame))
    }

    pub fn matches(&self, reference: &Frame) -> bool {
        self.frame.same_pixels(reference)
    }
}

/// Result of waiting for a screen to match its reference
#[derive(Debug, Clone)]
pub struct ScreenMatch {
    /// The last capture taken; left on disk either way
    pub capture: ScreenCapture,
    pub matched: bool,
    /// Number of captures compared, at least 1
    pub attempts: u32,
}

/// Canonical capture name for a sequence position
pub fn capture_name(prefix: &str, seq: u64) -> String {
    format!("{}{:03}.png", prefix, seq)
}

/// Load a golden reference frame
pub async fn load_reference(path: &Path) -> Result<Frame> {
    let is_file = tokio::fs::metadata(path).await.map(|m| m.is_file()).unwrap_or(false);
    if !is_file {
        return Err(Error::MissingReference(path.to_path_buf()));
    }
    Frame::load(path).await
}

/// Convert a raw screendump to PNG at `dest` and delete the raw file
pub async fn convert_dump(raw: &Path, dest: &Path) -> Result<Frame> {
    let (raw, dest) = (raw.to_path_buf(), dest.to_path_buf());
    blocking(move || {
        let img = image::open(&raw)?.to_rgb8();
        img.save(&dest)?;
        remove_if_exists(&raw)?;
        Ok(Frame::from_rgb(img))
    })
    .await
}

/// Run image codec work off the async worker threads
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::Internal(format!("image task failed: {}", e)))?
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Delete `path` if it exists
pub(crate) async fn discard(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn solid(color: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(8, 6, Rgb(color))
    }

    #[test]
    fn test_capture_name_is_zero_padded_and_ordered() {
        assert_eq!(capture_name("menu_test_", 1), "menu_test_001.png");
        assert_eq!(capture_name("menu_test_", 12), "menu_test_012.png");
        assert!(capture_name("x", 9) < capture_name("x", 10));
    }

    #[test]
    fn test_hash_depends_on_content_and_shape() {
        let a = Frame::from_rgb(solid([1, 2, 3]));
        let b = Frame::from_rgb(solid([1, 2, 3]));
        let c = Frame::from_rgb(solid([1, 2, 4]));
        assert_eq!(a.content_hash(), b.content_hash());
        assert_ne!(a.content_hash(), c.content_hash());

        let wide = Frame::from_rgb(RgbImage::from_pixel(6, 8, Rgb([1, 2, 3])));
        assert_eq!(wide.pixels, a.pixels);
        assert_ne!(wide.content_hash(), a.content_hash());
        assert!(!wide.same_pixels(&a));
    }

    #[tokio::test]
    async fn test_convert_dump_replaces_ppm_with_png() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("dump.ppm");
        let dest = dir.path().join("menu_test_001.png");
        solid([200, 10, 10]).save(&raw).unwrap();

        let frame = convert_dump(&raw, &dest).await.unwrap();
        assert!(!raw.exists());
        assert!(dest.exists());
        assert!(Frame::open(&dest).unwrap().same_pixels(&frame));
    }

    #[tokio::test]
    async fn test_convert_dump_of_partial_file_fails_and_keeps_it() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("dump.ppm");
        let dest = dir.path().join("menu_test_001.png");
        std::fs::write(&raw, b"P6\n8 6\n255\n\x01\x02").unwrap();

        assert!(convert_dump(&raw, &dest).await.is_err());
        assert!(raw.exists());
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_missing_reference_is_distinct_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("menu_test_001.png");
        assert!(matches!(
            load_reference(&missing).await,
            Err(Error::MissingReference(p)) if p == missing
        ));
    }
}
