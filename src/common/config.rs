//! Configuration file handling
//!
//! Every value has a default, so a missing config file is equivalent to an
//! empty one. The timing values were tuned empirically against qemu-eos and
//! are all overridable.

use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::paths::config_path;
use super::Result;
use crate::screen::{CapturePolicy, StabilityConfig};

/// Main configuration structure
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Emulator install layout and launch options
    #[serde(default)]
    pub emulator: EmulatorConfig,

    /// Timing settings
    #[serde(default)]
    pub timeouts: Timeouts,

    /// Screen capture stability retry settings
    #[serde(default)]
    pub stability: StabilitySettings,

    /// Port bases, offset by job id
    #[serde(default)]
    pub ports: Ports,

    /// Per-device overrides
    #[serde(default)]
    pub devices: DeviceSettings,
}

/// Emulator install layout
#[derive(Debug, Deserialize, Clone)]
pub struct EmulatorConfig {
    /// Emulator executable, relative to the emulator dir unless absolute
    #[serde(default = "default_binary")]
    pub binary: PathBuf,

    /// Directory holding per-model disk images, relative to the emulator dir
    #[serde(default = "default_disk_images")]
    pub disk_images: PathBuf,

    /// Boot the card image instead of the plain firmware
    #[serde(default)]
    pub boot: bool,

    /// Emulator log categories passed via `-d`
    #[serde(default)]
    pub trace_flags: Vec<String>,

    /// Optional TCG plugin library
    pub plugin: Option<PathBuf>,

    /// Arguments for the plugin, e.g. `debugmsg_addr=ff0c1234`
    #[serde(default)]
    pub plugin_args: Vec<String>,

    /// Expose a GDB stub on `ports.gdb_base + job`
    #[serde(default)]
    pub gdb: bool,

    /// Freeze the CPU at startup until a debugger attaches
    #[serde(default)]
    pub gdb_wait: bool,

    /// Expose a VNC display on `ports.vnc_base + job`
    #[serde(default)]
    pub vnc: bool,

    /// Redirect the emulated serial port into this file name inside the test dir
    pub serial_log: Option<String>,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            disk_images: default_disk_images(),
            boot: false,
            trace_flags: Vec::new(),
            plugin: None,
            plugin_args: Vec::new(),
            gdb: false,
            gdb_wait: false,
            vnc: false,
            serial_log: None,
        }
    }
}

fn default_binary() -> PathBuf {
    PathBuf::from("arm-softmmu").join("qemu-system-arm")
}

fn default_disk_images() -> PathBuf {
    PathBuf::from("disk_images")
}

/// Timing settings in milliseconds
#[derive(Debug, Deserialize, Clone)]
pub struct Timeouts {
    /// Wait after spawning before connecting the control socket
    #[serde(default = "default_warmup")]
    pub warmup_ms: u64,

    /// Wait after sending a shutdown command
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,

    /// Upper bound on waiting for a screendump file to become readable
    #[serde(default = "default_screendump")]
    pub screendump_ms: u64,

    /// How long a menu screen may take to match its reference
    #[serde(default = "default_expect_screen")]
    pub expect_screen_ms: u64,

    /// Delay between re-captures while waiting for a match
    #[serde(default = "default_expect_poll")]
    pub expect_poll_ms: u64,

    /// Pre-capture delay after a key press
    #[serde(default = "default_capture_delay")]
    pub capture_delay_ms: u64,

    /// Pre-capture delay after a `wait`-prefixed key press
    #[serde(default = "default_slow_capture_delay")]
    pub slow_capture_delay_ms: u64,

    /// How long LogTest lets emulation run before shutting down
    #[serde(default = "default_log_settle")]
    pub log_settle_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            warmup_ms: default_warmup(),
            shutdown_grace_ms: default_shutdown_grace(),
            screendump_ms: default_screendump(),
            expect_screen_ms: default_expect_screen(),
            expect_poll_ms: default_expect_poll(),
            capture_delay_ms: default_capture_delay(),
            slow_capture_delay_ms: default_slow_capture_delay(),
            log_settle_ms: default_log_settle(),
        }
    }
}

fn default_warmup() -> u64 {
    5_500
}
fn default_shutdown_grace() -> u64 {
    2_000
}
fn default_screendump() -> u64 {
    3_000
}
fn default_expect_screen() -> u64 {
    10_000
}
fn default_expect_poll() -> u64 {
    250
}
fn default_capture_delay() -> u64 {
    300
}
fn default_slow_capture_delay() -> u64 {
    5_000
}
fn default_log_settle() -> u64 {
    10_000
}

impl Timeouts {
    pub fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup_ms)
    }
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
    pub fn screendump(&self) -> Duration {
        Duration::from_millis(self.screendump_ms)
    }
    pub fn expect_screen(&self) -> Duration {
        Duration::from_millis(self.expect_screen_ms)
    }
    pub fn expect_poll(&self) -> Duration {
        Duration::from_millis(self.expect_poll_ms)
    }
    pub fn capture_delay(&self) -> Duration {
        Duration::from_millis(self.capture_delay_ms)
    }
    pub fn slow_capture_delay(&self) -> Duration {
        Duration::from_millis(self.slow_capture_delay_ms)
    }
    pub fn log_settle(&self) -> Duration {
        Duration::from_millis(self.log_settle_ms)
    }
}

/// Stability retry settings for devices with unreliable screen captures
#[derive(Debug, Deserialize, Clone)]
pub struct StabilitySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Long enough that two grabs can't land on the same corrupt frame
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

impl Default for StabilitySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}
fn default_retry_delay() -> u64 {
    200
}

impl StabilitySettings {
    pub fn to_config(&self) -> StabilityConfig {
        StabilityConfig {
            max_attempts: self.max_attempts.max(1),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }
}

/// Port bases; each test adds its job id
#[derive(Debug, Deserialize, Clone)]
pub struct Ports {
    #[serde(default = "default_gdb_base")]
    pub gdb_base: u16,

    /// VNC display number base (`-vnc :N`)
    #[serde(default = "default_vnc_base")]
    pub vnc_base: u16,
}

impl Default for Ports {
    fn default() -> Self {
        Self {
            gdb_base: default_gdb_base(),
            vnc_base: default_vnc_base(),
        }
    }
}

fn default_gdb_base() -> u16 {
    1234
}
fn default_vnc_base() -> u16 {
    12345
}

/// Per-device settings
#[derive(Debug, Deserialize, Default, Clone)]
pub struct DeviceSettings {
    /// Models whose display redraws asynchronously, captured with stability retries
    #[serde(default)]
    pub unreliable_screencaps: BTreeSet<String>,
}

impl Config {
    /// Load configuration from the default config file
    ///
    /// Returns default configuration if file doesn't exist
    pub fn load() -> Result<Self> {
        if let Some(path) = config_path() {
            if path.exists() {
                return Self::load_from(&path);
            }
        }
        Ok(Self::default())
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| super::Error::file_read(path, e))?;
        toml::from_str(&content).map_err(|e| super::Error::ConfigParse(e.to_string()))
    }

    /// Resolve the emulator executable inside an install dir
    ///
    /// Falls back to searching PATH when the configured binary is a bare name
    pub fn emulator_binary(&self, emulator_dir: &Path) -> PathBuf {
        let candidate = emulator_dir.join(&self.emulator.binary);
        if candidate.exists() {
            return candidate;
        }
        if self.emulator.binary.components().count() == 1 {
            if let Ok(found) = which::which(&self.emulator.binary) {
                return found;
            }
        }
        candidate
    }

    /// Capture policy for a model
    pub fn capture_policy(&self, unreliable: bool) -> CapturePolicy {
        if unreliable {
            CapturePolicy::Stabilized(self.stability.to_config())
        } else {
            CapturePolicy::Direct
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.timeouts.warmup_ms, 5_500);
        assert_eq!(config.timeouts.shutdown_grace_ms, 2_000);
        assert_eq!(config.stability.max_attempts, 5);
        assert_eq!(config.ports.gdb_base, 1234);
        assert_eq!(config.emulator.binary, default_binary());
        assert!(config.devices.unreliable_screencaps.is_empty());
    }

    #[test]
    fn test_partial_config_overrides() {
        let config: Config = toml::from_str(
            r#"
[timeouts]
warmup_ms = 100

[stability]
max_attempts = 3
retry_delay_ms = 150

[devices]
unreliable_screencaps = ["100D", "700D"]
"#,
        )
        .unwrap();
        assert_eq!(config.timeouts.warmup(), Duration::from_millis(100));
        assert_eq!(config.timeouts.log_settle_ms, 10_000);
        let stab = config.stability.to_config();
        assert_eq!(stab.max_attempts, 3);
        assert_eq!(stab.retry_delay, Duration::from_millis(150));
        assert!(config.devices.unreliable_screencaps.contains("700D"));
    }

    #[test]
    fn test_capture_policy_selection() {
        let config = Config::default();
        assert!(matches!(config.capture_policy(false), CapturePolicy::Direct));
        assert!(matches!(
            config.capture_policy(true),
            CapturePolicy::Stabilized(StabilityConfig { max_attempts: 5, .. })
        ));
    }

    #[test]
    fn test_load_from_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[timeouts]\nwarmup_ms = \"soon\"\n").unwrap();
        assert!(matches!(
            Config::load_from(&path),
            Err(super::super::Error::ConfigParse(_))
        ));
    }
}
