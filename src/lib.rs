//! qemu-eos regression test harness
//!
//! Drives emulated Canon cams (qemu-eos) through scripted interactions and
//! checks their screens and logs against golden references, many cams in
//! parallel.

pub mod cli;
pub mod commands;
pub mod common;
pub mod device;
pub mod emulator;
pub mod screen;
pub mod testing;

// Re-export commonly used types for tests
pub use common::{Error, Result};
pub use emulator::{Emulator, EmulatorSession, SessionConfig, ShutdownMode};
