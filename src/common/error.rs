//! Error types for the test harness
//!
//! Errors fall into four groups: pre-flight setup problems (bad directories,
//! unsupported cams), emulator startup failures, assertion-style failures that
//! tests convert into a failed verdict, and internal consistency violations
//! that indicate a bug in the harness itself.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the harness
#[derive(Error, Debug)]
pub enum Error {
    // === Pre-flight / Setup Errors ===
    #[error("Model not in supported cams: {0}")]
    UnsupportedDevice(String),

    #[error("Rom subdir didn't exist: {}", .path.display())]
    RomDirMissing { path: PathBuf },

    #[error("Couldn't find {name}: {}", .path.display())]
    RomMissing { name: String, path: PathBuf },

    #[error("No code rom mapping for {model} (DIGIC {digic})")]
    CodeRomUnknown { model: String, digic: u8 },

    #[error("Setup error: {0}")]
    Setup(String),

    // === Emulator Errors ===
    #[error("Failed to start emulator '{}': {error}", .path.display())]
    EmulatorSpawn {
        path: PathBuf,
        #[source]
        error: io::Error,
    },

    #[error("Emulator died during startup ({status})\n--- stdout ---\n{stdout}\n--- stderr ---\n{stderr}")]
    Startup {
        status: String,
        stdout: String,
        stderr: String,
    },

    #[error("Control channel error: {0}")]
    ControlChannel(#[source] io::Error),

    #[error("Control channel is not connected")]
    ControlChannelClosed,

    #[error("Screendump never produced a readable image: {}", .0.display())]
    ScreenDump(PathBuf),

    // === Screen / Assertion Errors ===
    #[error("Missing expected output file: {}", .0.display())]
    MissingReference(PathBuf),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    // === Internal Errors ===
    #[error("Internal consistency error (harness bug): {0}")]
    InternalConsistency(String),

    #[error("Internal error: {0}")]
    Internal(String),

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a file read error for a path
    pub fn file_read(path: &std::path::Path, error: impl std::fmt::Display) -> Self {
        Self::FileRead {
            path: path.display().to_string(),
            error: error.to_string(),
        }
    }

    /// Create an internal consistency error
    pub fn consistency(message: impl Into<String>) -> Self {
        Self::InternalConsistency(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_error_surfaces_output_verbatim() {
        let e = Error::Startup {
            status: "exit status: 1".to_string(),
            stdout: String::new(),
            stderr: "qemu: could not load ROM".to_string(),
        };
        let text = e.to_string();
        assert!(text.contains("exit status: 1"));
        assert!(text.contains("qemu: could not load ROM"));
    }
}
