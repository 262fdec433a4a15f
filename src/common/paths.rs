//! Socket, configuration and emulator layout paths
//!
//! Control sockets live in `$XDG_RUNTIME_DIR/qemu-eos-test/` or
//! `/tmp/qemu-eos-test-<uid>/`, never inside the test output tree: Unix socket
//! paths are limited to ~100 bytes and output dirs can be arbitrarily deep.

use std::io;
use std::path::{Path, PathBuf};

/// Name used for the socket dir and config dir
const APP_NAME: &str = "qemu-eos-test";

/// Directory holding the emulator control sockets of this user
#[cfg(unix)]
pub fn socket_dir() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join(APP_NAME);
    }

    // Fallback to /tmp with uid for security
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/tmp/{}-{}", APP_NAME, uid))
}

#[cfg(not(unix))]
pub fn socket_dir() -> PathBuf {
    std::env::temp_dir().join(APP_NAME)
}

/// Control socket path for one job
///
/// The harness pid is part of the name so two concurrent harness
/// invocations with overlapping job ids never collide.
pub fn monitor_socket_path(job_id: u32) -> PathBuf {
    socket_dir().join(format!("qemu-{}-{}.monitor", std::process::id(), job_id))
}

/// Ensure the socket directory exists with proper permissions
///
/// On Unix, creates the directory with mode 0700
pub fn ensure_socket_dir() -> io::Result<PathBuf> {
    let dir = socket_dir();
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
        }
    }
    Ok(dir)
}

/// Remove a socket file, tolerating its absence
pub fn remove_socket(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Get the configuration directory path
///
/// - Linux: `~/.config/qemu-eos-test/`
/// - macOS: `~/Library/Application Support/qemu-eos-test/`
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the path to the configuration file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

/// Per-model directory of pristine disk images inside the emulator install
pub fn disk_image_dir(emulator_dir: &Path, disk_images: &Path, model: &str) -> PathBuf {
    emulator_dir.join(disk_images).join(model)
}

/// Golden reference directory for one (model, test class) pair
pub fn expected_output_dir(expected_root: &Path, model: &str, class_name: &str) -> PathBuf {
    expected_root.join(model).join(class_name)
}
