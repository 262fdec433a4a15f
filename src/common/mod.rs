//! Common utilities shared by the emulator layer, tests and CLI

pub mod config;
pub mod console;
pub mod error;
pub mod logging;
pub mod paths;

pub use config::Config;
pub use console::Console;
pub use error::{Error, Result};
