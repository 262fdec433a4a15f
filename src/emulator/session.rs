//! One emulator process and the channels used to drive it
//!
//! The session owns the process, the monitor connection and the temp files
//! capturing its output. `teardown()` releases all of them and is safe to
//! call more than once; `Drop` does a best-effort version for panics.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::process::{Child, Command};

use super::control::{ControlChannel, MonitorCommand};
use super::{Emulator, ShutdownMode};
use crate::common::{paths, Error, Result};
use crate::screen::{convert_dump, discard, CapturePolicy, FrameGrabber};

/// How the emulator presents its display
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DisplaySpec {
    /// No window; captures go through the monitor
    #[default]
    Headless,
    /// VNC server on display `:N`, for watching a run by hand
    Vnc { display: u16 },
}

/// TCG plugin loaded into the emulator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginSpec {
    pub library: PathBuf,
    pub args: Vec<String>,
}

/// GDB stub settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GdbStub {
    pub port: u16,
    /// Freeze the CPU at startup until a debugger connects
    pub wait_for_debugger: bool,
}

/// Fixed delays the session relies on instead of acknowledgements
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimings {
    pub warmup: Duration,
    pub shutdown_grace: Duration,
    pub screendump: Duration,
    pub expect_poll: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            warmup: Duration::from_millis(5_500),
            shutdown_grace: Duration::from_secs(2),
            screendump: Duration::from_secs(3),
            expect_poll: Duration::from_millis(250),
        }
    }
}

/// Everything needed to launch one emulator
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub executable: PathBuf,
    pub model: String,
    /// Exported as `QEMU_EOS_WORKDIR`, where the emulator finds ROMs
    pub rom_dir: PathBuf,
    /// Emulator cwd; captures are written here
    pub work_dir: PathBuf,
    /// Must be unique per concurrent session
    pub monitor_socket: PathBuf,
    pub sd_image: Option<PathBuf>,
    pub cf_image: Option<PathBuf>,
    pub display: DisplaySpec,
    pub trace_flags: Vec<String>,
    pub plugin: Option<PluginSpec>,
    pub gdb: Option<GdbStub>,
    pub serial_log: Option<PathBuf>,
    pub boot: bool,
    /// Pass emulator output through instead of capturing it
    pub verbose: bool,
    pub capture_prefix: String,
    pub capture_policy: CapturePolicy,
    pub timings: SessionTimings,
}

impl SessionConfig {
    /// Full emulator argument vector
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(sd) = &self.sd_image {
            args.push("-drive".to_string());
            args.push(format!("if=sd,format=qcow2,file={}", sd.display()));
        }
        if let Some(cf) = &self.cf_image {
            args.push("-drive".to_string());
            args.push(format!("if=ide,format=qcow2,file={}", cf.display()));
        }

        args.push("-chardev".to_string());
        args.push(format!(
            "socket,server,nowait,path={},id=monsock",
            self.monitor_socket.display()
        ));
        args.push("-mon".to_string());
        args.push("chardev=monsock,mode=readline".to_string());

        args.push("-name".to_string());
        args.push(self.model.clone());
        args.push("-M".to_string());
        args.push(format!(
            "{},firmware=boot={}",
            self.model,
            if self.boot { 1 } else { 0 }
        ));

        match &self.display {
            DisplaySpec::Headless => {
                args.push("-display".to_string());
                args.push("none".to_string());
            }
            DisplaySpec::Vnc { display } => {
                args.push("-vnc".to_string());
                args.push(format!(":{}", display));
            }
        }

        if !self.trace_flags.is_empty() {
            args.push("-d".to_string());
            args.push(self.trace_flags.join(","));
        }

        if let Some(plugin) = &self.plugin {
            let mut spec = plugin.library.display().to_string();
            for arg in &plugin.args {
                spec.push_str(&format!(",arg={}", arg));
            }
            args.push("-plugin".to_string());
            args.push(spec);
        }

        if let Some(gdb) = &self.gdb {
            args.push("-gdb".to_string());
            args.push(format!("tcp::{}", gdb.port));
            if gdb.wait_for_debugger {
                args.push("-S".to_string());
            }
        }

        if let Some(serial) = &self.serial_log {
            args.push("-serial".to_string());
            args.push(format!("file:{}", serial.display()));
        }

        args
    }
}

/// A running emulator
pub struct EmulatorSession {
    config: SessionConfig,
    child: Child,
    control: Option<ControlChannel>,
    stdout: Option<NamedTempFile>,
    stderr: Option<NamedTempFile>,
    capture_counter: u64,
    torn_down: bool,
}

impl EmulatorSession {
    /// Spawn the emulator and connect its control channel
    ///
    /// Blocks for the configured warm-up first: the emulator needs time to
    /// create its listening socket. A process that has already exited is
    /// reported as `Error::Startup` with its captured output.
    pub async fn start(config: SessionConfig) -> Result<Self> {
        if let Some(dir) = config.monitor_socket.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        paths::remove_socket(&config.monitor_socket)?;

        let (stdout, stderr, out_stdio, err_stdio) = if config.verbose {
            (None, None, Stdio::inherit(), Stdio::inherit())
        } else {
            let out = tempfile::Builder::new()
                .prefix("qemu-stdout-")
                .tempfile()?;
            let err = tempfile::Builder::new()
                .prefix("qemu-stderr-")
                .tempfile()?;
            // reopen() gives the child its own file offset
            let out_stdio = Stdio::from(out.reopen()?);
            let err_stdio = Stdio::from(err.reopen()?);
            (Some(out), Some(err), out_stdio, err_stdio)
        };

        let args = config.args();
        tracing::debug!("{} {}", config.executable.display(), args.join(" "));

        let child = Command::new(&config.executable)
            .args(&args)
            .env("QEMU_EOS_WORKDIR", &config.rom_dir)
            .current_dir(&config.work_dir)
            .stdin(Stdio::null())
            .stdout(out_stdio)
            .stderr(err_stdio)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::EmulatorSpawn {
                path: config.executable.clone(),
                error: e,
            })?;

        tracing::info!(
            "Started emulator for {} (pid {:?}, monitor {})",
            config.model,
            child.id(),
            config.monitor_socket.display()
        );

        let mut session = Self {
            config,
            child,
            control: None,
            stdout,
            stderr,
            capture_counter: 0,
            torn_down: false,
        };

        match session.connect_and_check().await {
            Ok(()) => Ok(session),
            Err(e) => {
                session.teardown().await;
                Err(e)
            }
        }
    }

    async fn connect_and_check(&mut self) -> Result<()> {
        tokio::time::sleep(self.config.timings.warmup).await;

        let connected = ControlChannel::connect(&self.config.monitor_socket).await;

        // A dead process can leave a stale socket behind, so liveness is
        // checked whether or not the connect worked
        if let Some(status) = self.child.try_wait()? {
            return Err(Error::Startup {
                status: status.to_string(),
                stdout: self.stdout_text()?,
                stderr: self.stderr_text()?,
            });
        }

        self.control = Some(connected.map_err(Error::ControlChannel)?);
        Ok(())
    }

    /// Whether the emulator process is still running
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn send(&mut self, command: MonitorCommand) -> Result<()> {
        let control = self.control.as_mut().ok_or(Error::ControlChannelClosed)?;
        control.send(&command).await.map_err(Error::ControlChannel)
    }

    fn read_capture(file: &Option<NamedTempFile>) -> Result<String> {
        match file {
            Some(f) => {
                let bytes = std::fs::read(f.path()).map_err(|e| Error::file_read(f.path(), e))?;
                Ok(String::from_utf8_lossy(&bytes).into_owned())
            }
            None => Ok(String::new()),
        }
    }

    async fn terminate(&mut self) {
        if !matches!(self.child.try_wait(), Ok(None)) {
            return;
        }

        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            // SIGTERM first so the emulator can flush its logs
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
            let grace = self.config.timings.shutdown_grace;
            if tokio::time::timeout(grace, self.child.wait()).await.is_ok() {
                return;
            }
        }

        if let Err(e) = self.child.kill().await {
            tracing::warn!("Failed to kill emulator for {}: {}", self.config.model, e);
        }
    }
}

#[async_trait]
impl FrameGrabber for EmulatorSession {
    async fn grab_frame(&mut self, dest: &Path) -> Result<()> {
        let raw = dest.with_extension("ppm");
        // A dump left over from an earlier grab must not pass for this one
        discard(&raw).await?;
        self.send(MonitorCommand::ScreenDump(raw.clone())).await?;

        // The monitor doesn't acknowledge, so poll until the dump decodes
        let deadline = Instant::now() + self.config.timings.screendump;
        loop {
            if raw.exists() && convert_dump(&raw, dest).await.is_ok() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::ScreenDump(raw));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

#[async_trait]
impl Emulator for EmulatorSession {
    async fn key_press(&mut self, key: &str) -> Result<()> {
        self.send(MonitorCommand::SendKey(key.to_string())).await
    }

    async fn shutdown(&mut self, mode: ShutdownMode) -> Result<()> {
        let Some(mut control) = self.control.take() else {
            return Ok(());
        };

        let command = match mode {
            ShutdownMode::Graceful => MonitorCommand::SystemPowerdown,
            ShutdownMode::Force => MonitorCommand::Quit,
        };
        tracing::debug!("Shutting down {} ({:?})", self.config.model, mode);

        let sent = control.send(&command).await;
        control.close().await;
        tokio::time::sleep(self.config.timings.shutdown_grace).await;
        sent.map_err(Error::ControlChannel)
    }

    fn stdout_text(&self) -> Result<String> {
        Self::read_capture(&self.stdout)
    }

    fn stderr_text(&self) -> Result<String> {
        Self::read_capture(&self.stderr)
    }

    fn capture_dir(&self) -> &Path {
        &self.config.work_dir
    }

    fn capture_policy(&self) -> CapturePolicy {
        self.config.capture_policy.clone()
    }

    fn poll_interval(&self) -> Duration {
        self.config.timings.expect_poll
    }

    fn next_capture_seq(&mut self) -> u64 {
        self.capture_counter += 1;
        self.capture_counter
    }

    fn capture_prefix(&self) -> &str {
        &self.config.capture_prefix
    }

    async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        self.terminate().await;
        self.stdout = None;
        self.stderr = None;
        if let Some(control) = self.control.take() {
            control.close().await;
        }
        if let Err(e) = paths::remove_socket(&self.config.monitor_socket) {
            tracing::warn!(
                "Failed to remove monitor socket {}: {}",
                self.config.monitor_socket.display(),
                e
            );
        }
        tracing::debug!("Tore down emulator for {}", self.config.model);
    }
}

impl Drop for EmulatorSession {
    fn drop(&mut self) {
        if self.torn_down {
            return;
        }
        let _ = self.child.start_kill();
        let _ = paths::remove_socket(&self.config.monitor_socket);
    }
}
