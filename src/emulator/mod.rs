//! Emulator control layer
//!
//! [`EmulatorSession`] drives a real qemu-eos process. Tests talk to it
//! through the [`Emulator`] trait, and sessions are created by a
//! [`Launcher`], which lets the test variants run against scripted fakes.

pub mod control;
pub mod session;

use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::common::Result;
use crate::screen::{capture_name, load_reference, CapturePolicy, FrameGrabber, ScreenCapture, ScreenMatch};

pub use session::{DisplaySpec, EmulatorSession, GdbStub, PluginSpec, SessionConfig, SessionTimings};

/// How to ask the emulator to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// `system_powerdown`: guest shuts down like the power switch was used
    Graceful,
    /// `quit`: emulator exits immediately
    Force,
}

/// A live emulator a test can drive
#[async_trait]
pub trait Emulator: FrameGrabber + Send {
    /// Press and release one key; nothing is read back
    async fn key_press(&mut self, key: &str) -> Result<()>;

    /// Send a shutdown command and wait the grace period
    ///
    /// A no-op once the control channel is closed.
    async fn shutdown(&mut self, mode: ShutdownMode) -> Result<()>;

    /// Captured emulator stdout so far (empty when passed through)
    fn stdout_text(&self) -> Result<String>;

    /// Captured emulator stderr so far (empty when passed through)
    fn stderr_text(&self) -> Result<String>;

    /// Directory captures are written into
    fn capture_dir(&self) -> &Path;

    fn capture_policy(&self) -> CapturePolicy;

    /// Delay between re-captures in `expect_screen`
    fn poll_interval(&self) -> Duration;

    /// Advance and return the capture counter (first call returns 1)
    fn next_capture_seq(&mut self) -> u64;

    fn capture_prefix(&self) -> &str;

    /// Release the process, channels and temp files; idempotent
    async fn teardown(&mut self);

    /// Capture the screen into the next canonical slot
    async fn capture_screen(&mut self, delay: Duration) -> Result<ScreenCapture> {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let seq = self.next_capture_seq();
        let name = capture_name(self.capture_prefix(), seq);
        let slot = self.capture_dir().join(&name);
        let policy = self.capture_policy();
        Ok(policy.capture(&mut *self, &slot, &name, seq).await?.capture)
    }

    /// Capture until the screen equals its reference pixel for pixel
    ///
    /// The reference is the file in `expected_dir` named like the capture.
    /// Always captures at least once, even with a zero timeout. All attempts
    /// share one capture slot, and the last capture is left on disk whether or
    /// not it matched. A missing reference is reported after the first
    /// capture so the capture is still available for building new references.
    async fn expect_screen(
        &mut self,
        expected_dir: &Path,
        timeout: Duration,
        delay: Duration,
    ) -> Result<ScreenMatch> {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let seq = self.next_capture_seq();
        let name = capture_name(self.capture_prefix(), seq);
        let slot = self.capture_dir().join(&name);
        let reference = expected_dir.join(&name);
        let policy = self.capture_policy();
        let poll = self.poll_interval();

        let start = Instant::now();
        let mut capture = policy.capture(&mut *self, &slot, &name, seq).await?.capture;
        let expected = load_reference(&reference).await?;
        let mut attempts = 1;

        loop {
            if capture.matches(&expected) {
                return Ok(ScreenMatch {
                    capture,
                    matched: true,
                    attempts,
                });
            }
            if start.elapsed() >= timeout {
                tracing::debug!(
                    "{} didn't match {} after {} attempts",
                    name,
                    reference.display(),
                    attempts
                );
                return Ok(ScreenMatch {
                    capture,
                    matched: false,
                    attempts,
                });
            }
            tokio::time::sleep(poll).await;
            capture = policy.capture(&mut *self, &slot, &name, seq).await?.capture;
            attempts += 1;
        }
    }
}

/// Creates emulator sessions for tests
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, config: SessionConfig) -> Result<Box<dyn Emulator>>;
}

/// Launches real qemu-eos processes
#[derive(Debug, Default, Clone, Copy)]
pub struct QemuLauncher;

#[async_trait]
impl Launcher for QemuLauncher {
    async fn launch(&self, config: SessionConfig) -> Result<Box<dyn Emulator>> {
        Ok(Box::new(EmulatorSession::start(config).await?))
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scripted emulator for exercising tests without qemu

    use super::*;
    use crate::common::Error;
    use crate::screen::ScriptedGrabber;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    /// Failure injected into a fake's key presses, counted from 1
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Fault {
        ErrorAt(usize),
        PanicAt(usize),
    }

    /// What a fake emulator was asked to do, shared with the test body
    #[derive(Debug, Default)]
    pub struct FakeLog {
        pub keys: Vec<String>,
        pub shutdowns: Vec<ShutdownMode>,
        pub grabs: usize,
        pub teardowns: usize,
        pub configs: Vec<SessionConfig>,
    }

    pub struct FakeEmulator {
        grabber: ScriptedGrabber,
        dir: PathBuf,
        policy: CapturePolicy,
        prefix: String,
        counter: u64,
        connected: bool,
        stdout: String,
        stderr: String,
        presses: usize,
        fault: Option<Fault>,
        log: Arc<Mutex<FakeLog>>,
    }

    impl FakeEmulator {
        pub fn new(dir: &Path, frames: Vec<[u8; 3]>, log: Arc<Mutex<FakeLog>>) -> Self {
            Self {
                grabber: ScriptedGrabber::new(frames),
                dir: dir.to_path_buf(),
                policy: CapturePolicy::Direct,
                prefix: "cap_".to_string(),
                counter: 0,
                connected: true,
                stdout: String::new(),
                stderr: String::new(),
                presses: 0,
                fault: None,
                log,
            }
        }
    }

    #[async_trait]
    impl FrameGrabber for FakeEmulator {
        async fn grab_frame(&mut self, dest: &Path) -> Result<()> {
            self.log.lock().unwrap().grabs += 1;
            self.grabber.grab_frame(dest).await
        }
    }

    #[async_trait]
    impl Emulator for FakeEmulator {
        async fn key_press(&mut self, key: &str) -> Result<()> {
            self.presses += 1;
            // Checked before taking the log lock so a panic can't poison it
            match self.fault {
                Some(Fault::PanicAt(n)) if n == self.presses => {
                    panic!("boom in key_press {}", key)
                }
                Some(Fault::ErrorAt(n)) if n == self.presses => {
                    return Err(Error::ControlChannel(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "monitor went away",
                    )));
                }
                _ => {}
            }
            self.log.lock().unwrap().keys.push(key.to_string());
            Ok(())
        }

        async fn shutdown(&mut self, mode: ShutdownMode) -> Result<()> {
            if self.connected {
                self.connected = false;
                self.log.lock().unwrap().shutdowns.push(mode);
            }
            Ok(())
        }

        fn stdout_text(&self) -> Result<String> {
            Ok(self.stdout.clone())
        }

        fn stderr_text(&self) -> Result<String> {
            Ok(self.stderr.clone())
        }

        fn capture_dir(&self) -> &Path {
            &self.dir
        }

        fn capture_policy(&self) -> CapturePolicy {
            self.policy.clone()
        }

        fn poll_interval(&self) -> Duration {
            Duration::ZERO
        }

        fn next_capture_seq(&mut self) -> u64 {
            self.counter += 1;
            self.counter
        }

        fn capture_prefix(&self) -> &str {
            &self.prefix
        }

        async fn teardown(&mut self) {
            self.log.lock().unwrap().teardowns += 1;
        }
    }

    /// Launcher handing out fakes that replay `frames`
    pub struct FakeLauncher {
        pub frames: Vec<[u8; 3]>,
        pub stdout: String,
        pub stderr: String,
        pub fault: Option<Fault>,
        /// Launch fails as if the emulator died during startup
        pub fail_launch: bool,
        pub log: Arc<Mutex<FakeLog>>,
    }

    impl FakeLauncher {
        pub fn new(frames: Vec<[u8; 3]>) -> Self {
            Self {
                frames,
                stdout: String::new(),
                stderr: String::new(),
                fault: None,
                fail_launch: false,
                log: Arc::default(),
            }
        }
    }

    #[async_trait]
    impl Launcher for FakeLauncher {
        async fn launch(&self, config: SessionConfig) -> Result<Box<dyn Emulator>> {
            if self.fail_launch {
                self.log.lock().unwrap().configs.push(config);
                return Err(Error::Startup {
                    status: "exit status: 1".to_string(),
                    stdout: String::new(),
                    stderr: "qemu: could not load ROM".to_string(),
                });
            }
            let mut emu = FakeEmulator::new(&config.work_dir, self.frames.clone(), self.log.clone());
            emu.policy = config.capture_policy.clone();
            emu.prefix = config.capture_prefix.clone();
            emu.stdout = self.stdout.clone();
            emu.stderr = self.stderr.clone();
            emu.fault = self.fault;
            self.log.lock().unwrap().configs.push(config);
            Ok(Box::new(emu))
        }
    }
}
