//! Test cases and their execution scope
//!
//! A [`TestCase`] is created by the orchestrator, run exactly once by a
//! worker and then only read. Its verdict is reached through
//! `return_success` or `return_failure`, each of which may be called once.
//!
//! [`CaseRun`] is the scope a case body executes in: it owns the case output
//! directory, the disk image copies and the emulator session, and guarantees
//! the session is shut down and torn down however the body ends.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::FutureExt;
use serde::Serialize;

use crate::common::config::{Config, Ports};
use crate::common::{paths, Console, Error, Result};
use crate::device::Device;
use crate::emulator::{DisplaySpec, Emulator, GdbStub, Launcher, PluginSpec, SessionConfig, SessionTimings, ShutdownMode};

use super::scripts::ScriptBook;
use super::{fail, log, menu};

/// Test variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum TestKind {
    Menu,
    Log,
    Fail,
}

impl TestKind {
    /// Name used for output directories, reference directories and reasons
    pub fn class_name(self) -> &'static str {
        match self {
            TestKind::Menu => "MenuTest",
            TestKind::Log => "LogTest",
            TestKind::Fail => "FailTest",
        }
    }

    /// Prefix of the screen captures this variant takes
    pub fn capture_prefix(self) -> &'static str {
        match self {
            TestKind::Menu => "menu_test_",
            TestKind::Log => "log_test_",
            TestKind::Fail => "fail_test_",
        }
    }

    async fn execute(self, run: &mut CaseRun<'_>) -> Result<()> {
        match self {
            TestKind::Menu => menu::run(run).await,
            TestKind::Log => log::run(run).await,
            TestKind::Fail => fail::run(run).await,
        }
    }
}

/// Test groups that can be requested on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, clap::ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TestGroup {
    Menu,
    Log,
    Fail,
}

impl TestGroup {
    /// Groups run when none are requested
    pub fn defaults() -> Vec<TestGroup> {
        vec![TestGroup::Menu, TestGroup::Log]
    }

    pub fn kind(self) -> TestKind {
        match self {
            TestGroup::Menu => TestKind::Menu,
            TestGroup::Log => TestKind::Log,
            TestGroup::Fail => TestKind::Fail,
        }
    }

    /// Whether the device can run this group at all
    pub fn applies_to(self, device: &Device) -> bool {
        match self {
            TestGroup::Menu => device.can_emulate_gui,
            TestGroup::Log | TestGroup::Fail => true,
        }
    }
}

/// Per-case behaviour switches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CaseOptions {
    /// Pass emulator output through to the terminal
    pub verbose: bool,
    /// Keep going past failures; the case still ends failed
    pub force_continue: bool,
}

/// Resources derived from a job id, disjoint between concurrent cases
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSlots {
    pub job_id: u32,
    pub monitor_socket: PathBuf,
    pub vnc_display: u16,
    pub gdb_port: u16,
}

impl JobSlots {
    pub fn for_job(job_id: u32, ports: &Ports) -> Self {
        let offset = u16::try_from(job_id).unwrap_or(u16::MAX);
        Self {
            job_id,
            monitor_socket: paths::monitor_socket_path(job_id),
            vnc_display: ports.vnc_base.saturating_add(offset),
            gdb_port: ports.gdb_base.saturating_add(offset),
        }
    }
}

/// Shared, read-only context every case runs in
pub struct RunEnv {
    pub config: Config,
    pub launcher: Arc<dyn Launcher>,
    pub scripts: ScriptBook,
    pub console: Console,
    /// qemu-eos install: binary and pristine disk images
    pub emulator_dir: PathBuf,
}

/// One test of one device
#[derive(Debug, Clone, Serialize)]
pub struct TestCase {
    kind: TestKind,
    device: Device,
    slots: JobSlots,
    options: CaseOptions,
    output_dir: PathBuf,
    expected_dir: PathBuf,
    passed: Option<bool>,
    fail_reason: Option<String>,
}

impl TestCase {
    pub fn new(
        kind: TestKind,
        device: Device,
        slots: JobSlots,
        output_root: &Path,
        expected_root: &Path,
        options: CaseOptions,
    ) -> Self {
        let output_dir = output_root.join(&device.model).join(kind.class_name());
        let expected_dir = paths::expected_output_dir(expected_root, &device.model, kind.class_name());
        Self {
            kind,
            device,
            slots,
            options,
            output_dir,
            expected_dir,
            passed: None,
            fail_reason: None,
        }
    }

    pub fn kind(&self) -> TestKind {
        self.kind
    }

    pub fn class_name(&self) -> &'static str {
        self.kind.class_name()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn job_id(&self) -> u32 {
        self.slots.job_id
    }

    pub fn options(&self) -> CaseOptions {
        self.options
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn expected_dir(&self) -> &Path {
        &self.expected_dir
    }

    /// `None` until the case has run
    pub fn passed(&self) -> Option<bool> {
        self.passed
    }

    pub fn fail_reason(&self) -> Option<&str> {
        self.fail_reason.as_deref()
    }

    pub fn is_terminal(&self) -> bool {
        self.passed.is_some()
    }

    fn ensure_open(&self, action: &str) -> Result<()> {
        if self.is_terminal() {
            return Err(Error::consistency(format!(
                "{} on {} {} (job {}) which already finished",
                action,
                self.class_name(),
                self.device.model,
                self.slots.job_id
            )));
        }
        Ok(())
    }

    /// Mark the case passed; under `force_continue` it is marked failed instead
    ///
    /// Returns the resulting pass flag.
    pub fn return_success(&mut self) -> Result<bool> {
        self.ensure_open("return_success")?;
        if self.options.force_continue {
            self.passed = Some(false);
            self.fail_reason = Some(format!("{}: force_continue is set", self.class_name()));
        } else {
            self.passed = Some(true);
        }
        Ok(self.passed == Some(true))
    }

    /// Mark the case failed; `reason` gets the class name prepended
    pub fn return_failure(&mut self, reason: impl AsRef<str>) -> Result<bool> {
        self.ensure_open("return_failure")?;
        self.passed = Some(false);
        self.fail_reason = Some(format!("{}: {}", self.class_name(), reason.as_ref()));
        Ok(false)
    }

    /// Verify the verdict fields agree with each other
    pub fn check_consistent(&self) -> Result<()> {
        match (self.passed, &self.fail_reason) {
            (None, _) => Err(Error::consistency(format!(
                "{} {} (job {}) finished without a verdict",
                self.class_name(),
                self.device.model,
                self.slots.job_id
            ))),
            (Some(true), Some(reason)) => Err(Error::consistency(format!(
                "{} {} (job {}) passed with fail reason: {}",
                self.class_name(),
                self.device.model,
                self.slots.job_id,
                reason
            ))),
            _ => Ok(()),
        }
    }

    /// Run the case inside its execution scope
    ///
    /// Test failures, including errors and panics in the body, end up in the
    /// verdict. Only internal consistency violations are returned as errors.
    pub async fn run(&mut self, env: &RunEnv) -> Result<()> {
        self.ensure_open("run")?;
        let kind = self.kind;

        let images = match prepare_output(self, env).await {
            Ok(images) => images,
            Err(e) => {
                tracing::warn!("{} {}: setup failed: {}", kind.class_name(), self.device.model, e);
                self.return_failure(e.to_string())?;
                return Ok(());
            }
        };
        let mut run = CaseRun::new(self, env, images);

        let outcome = AssertUnwindSafe(kind.execute(&mut run)).catch_unwind().await;
        let result = match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e @ Error::InternalConsistency(_))) => Err(e),
            Ok(Err(e)) => run.fail_if_open(e.to_string()).await,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!("{} panicked: {}", kind.class_name(), message);
                run.fail_if_open(format!("panicked: {}", message)).await
            }
        };
        run.exit().await;
        result?;

        if !self.is_terminal() {
            return Err(Error::consistency(format!(
                "{} {} (job {}) returned without a verdict",
                kind.class_name(),
                self.device.model,
                self.slots.job_id
            )));
        }
        Ok(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Execution scope of one case
pub struct CaseRun<'a> {
    case: &'a mut TestCase,
    env: &'a RunEnv,
    session: Option<Box<dyn Emulator>>,
    sd_image: Option<PathBuf>,
    cf_image: Option<PathBuf>,
}

impl<'a> CaseRun<'a> {
    fn new(case: &'a mut TestCase, env: &'a RunEnv, images: DiskImages) -> Self {
        Self {
            case,
            env,
            session: None,
            sd_image: images.sd,
            cf_image: images.cf,
        }
    }

    pub fn case(&self) -> &TestCase {
        self.case
    }

    pub fn env(&self) -> &RunEnv {
        self.env
    }

    pub fn output_dir(&self) -> &Path {
        &self.case.output_dir
    }

    pub fn scripts(&self) -> &ScriptBook {
        &self.env.scripts
    }

    /// Session parameters for this case
    pub fn session_config(&self, verbose: bool) -> SessionConfig {
        let config = &self.env.config;
        let emu = &config.emulator;
        let device = &self.case.device;
        let slots = &self.case.slots;

        SessionConfig {
            executable: config.emulator_binary(&self.env.emulator_dir),
            model: device.model.clone(),
            rom_dir: device.rom_dir.clone(),
            work_dir: self.case.output_dir.clone(),
            monitor_socket: slots.monitor_socket.clone(),
            sd_image: self.sd_image.clone(),
            cf_image: self.cf_image.clone(),
            display: if emu.vnc {
                DisplaySpec::Vnc {
                    display: slots.vnc_display,
                }
            } else {
                DisplaySpec::Headless
            },
            trace_flags: emu.trace_flags.clone(),
            plugin: emu.plugin.as_ref().map(|library| PluginSpec {
                library: library.clone(),
                args: emu.plugin_args.clone(),
            }),
            gdb: emu.gdb.then_some(GdbStub {
                port: slots.gdb_port,
                wait_for_debugger: emu.gdb_wait,
            }),
            serial_log: emu
                .serial_log
                .as_ref()
                .map(|name| self.case.output_dir.join(name)),
            boot: emu.boot,
            verbose,
            capture_prefix: self.case.kind.capture_prefix().to_string(),
            capture_policy: config.capture_policy(device.unreliable_screencaps),
            timings: SessionTimings {
                warmup: config.timeouts.warmup(),
                shutdown_grace: config.timeouts.shutdown_grace(),
                screendump: config.timeouts.screendump(),
                expect_poll: config.timeouts.expect_poll(),
            },
        }
    }

    /// Launch the emulator; the scope owns it from now on
    pub async fn start_session(&mut self, verbose: bool) -> Result<&mut Box<dyn Emulator>> {
        if self.session.is_some() {
            return Err(Error::Internal("case already has a live session".into()));
        }
        let config = self.session_config(verbose);
        let session = self.env.launcher.launch(config).await?;
        Ok(self.session.insert(session))
    }

    /// The live session, if any
    pub fn session(&mut self) -> Option<&mut Box<dyn Emulator>> {
        self.session.as_mut()
    }

    /// Record success and close the session gracefully
    pub async fn succeed(&mut self) -> Result<bool> {
        let passed = self.case.return_success()?;
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.shutdown(ShutdownMode::Graceful).await {
                tracing::debug!("Shutdown after success failed: {}", e);
            }
            session.teardown().await;
        }
        Ok(passed)
    }

    /// Record failure and stop the emulator immediately
    pub async fn fail(&mut self, reason: impl AsRef<str>) -> Result<bool> {
        let reason = reason.as_ref();
        tracing::info!(
            "{} {} failed: {}",
            self.case.class_name(),
            self.case.device.model,
            reason
        );
        self.case.return_failure(reason)?;
        self.release(ShutdownMode::Force).await;
        Ok(false)
    }

    async fn fail_if_open(&mut self, reason: String) -> Result<()> {
        if self.case.is_terminal() {
            tracing::warn!(
                "{} {} errored after its verdict: {}",
                self.case.class_name(),
                self.case.device.model,
                reason
            );
            return Ok(());
        }
        self.fail(reason).await.map(|_| ())
    }

    async fn release(&mut self, mode: ShutdownMode) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.shutdown(mode).await {
                tracing::debug!("Shutdown during release failed: {}", e);
            }
            session.teardown().await;
        }
    }

    /// Leave the scope, stopping any session still alive
    async fn exit(mut self) {
        self.release(ShutdownMode::Force).await;
    }
}

/// Per-case copies of the device's disk images
#[derive(Debug, Default)]
struct DiskImages {
    sd: Option<PathBuf>,
    cf: Option<PathBuf>,
}

/// Create the case output dir and copy in the device's disk images
///
/// The output dir must not exist yet: a leftover from an earlier run
/// would mix its captures into this one.
async fn prepare_output(case: &TestCase, env: &RunEnv) -> Result<DiskImages> {
    let dir = &case.output_dir;
    if let Some(parent) = dir.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::create_dir(dir).await.map_err(|e| {
        Error::Setup(format!("Couldn't create output dir {}: {}", dir.display(), e))
    })?;

    let images = paths::disk_image_dir(
        &env.emulator_dir,
        &env.config.emulator.disk_images,
        &case.device.model,
    );
    let mut out = DiskImages::default();
    if case.device.has_sd {
        out.sd = Some(copy_image(&images.join("sd.qcow2"), dir).await?);
    }
    if case.device.has_cf {
        out.cf = Some(copy_image(&images.join("cf.qcow2"), dir).await?);
    }

    tracing::debug!(
        "{} {} (job {}) prepared {}",
        case.class_name(),
        case.device.model,
        case.slots.job_id,
        dir.display()
    );
    Ok(out)
}

async fn copy_image(source: &Path, dest_dir: &Path) -> Result<PathBuf> {
    let name = source
        .file_name()
        .ok_or_else(|| Error::Internal(format!("disk image path has no file name: {}", source.display())))?;
    let dest = dest_dir.join(name);
    tokio::fs::copy(source, &dest).await.map_err(|e| {
        Error::Setup(format!("Couldn't copy disk image {}: {}", source.display(), e))
    })?;
    Ok(dest)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::device::CodeRom;
    use crate::emulator::fake::{Fault, FakeLauncher};

    pub(crate) fn test_device(model: &str, md5: &str) -> Device {
        Device {
            model: model.to_string(),
            rom_dir: PathBuf::from("/roms"),
            rom0_md5: "00".to_string(),
            rom1_md5: md5.to_string(),
            digic: 5,
            code_rom: CodeRom::Rom1,
            can_emulate_gui: true,
            has_sd: false,
            has_cf: false,
            is_eos: true,
            is_powershot: false,
            unreliable_screencaps: false,
        }
    }

    pub(crate) fn test_env(emulator_dir: &Path, launcher: Arc<dyn Launcher>, scripts: ScriptBook) -> RunEnv {
        let mut config = Config::default();
        config.timeouts.capture_delay_ms = 0;
        config.timeouts.slow_capture_delay_ms = 0;
        config.timeouts.expect_screen_ms = 0;
        config.timeouts.log_settle_ms = 0;
        RunEnv {
            config,
            launcher,
            scripts,
            console: Console::new(),
            emulator_dir: emulator_dir.to_path_buf(),
        }
    }

    pub(crate) fn test_case(kind: TestKind, device: Device, out: &Path, options: CaseOptions) -> TestCase {
        let slots = JobSlots::for_job(0, &Ports::default());
        TestCase::new(kind, device, slots, out, &out.join("expected"), options)
    }

    #[test]
    fn test_second_verdict_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut case = test_case(TestKind::Fail, test_device("5D3", "aa"), dir.path(), CaseOptions::default());

        assert!(case.return_success().unwrap());
        assert!(matches!(
            case.return_failure("late"),
            Err(Error::InternalConsistency(_))
        ));
        assert!(matches!(
            case.return_success(),
            Err(Error::InternalConsistency(_))
        ));
        assert_eq!(case.passed(), Some(true));
        assert!(case.fail_reason().is_none());
    }

    #[test]
    fn test_force_continue_never_passes() {
        let dir = tempfile::tempdir().unwrap();
        let options = CaseOptions {
            verbose: false,
            force_continue: true,
        };
        let mut case = test_case(TestKind::Menu, test_device("5D3", "aa"), dir.path(), options);

        assert!(!case.return_success().unwrap());
        assert_eq!(case.passed(), Some(false));
        assert_eq!(case.fail_reason(), Some("MenuTest: force_continue is set"));
        case.check_consistent().unwrap();
    }

    #[test]
    fn test_failure_reason_is_prefixed() {
        let dir = tempfile::tempdir().unwrap();
        let mut case = test_case(TestKind::Log, test_device("50D", "aa"), dir.path(), CaseOptions::default());
        case.return_failure("Stdout was non-empty").unwrap();
        assert_eq!(case.fail_reason(), Some("LogTest: Stdout was non-empty"));
    }

    #[test]
    fn test_unrun_case_is_inconsistent() {
        let dir = tempfile::tempdir().unwrap();
        let case = test_case(TestKind::Fail, test_device("5D3", "aa"), dir.path(), CaseOptions::default());
        assert!(matches!(
            case.check_consistent(),
            Err(Error::InternalConsistency(_))
        ));
    }

    #[test]
    fn test_job_slots_are_offset_by_job_id() {
        let slots = JobSlots::for_job(3, &Ports::default());
        assert_eq!(slots.gdb_port, 1237);
        assert_eq!(slots.vnc_display, 12348);
        assert_ne!(slots.monitor_socket, JobSlots::for_job(4, &Ports::default()).monitor_socket);
    }

    #[test]
    fn test_menu_group_needs_gui() {
        let mut device = test_device("5D", "aa");
        device.can_emulate_gui = false;
        assert!(!TestGroup::Menu.applies_to(&device));
        assert!(TestGroup::Log.applies_to(&device));
    }

    #[tokio::test]
    async fn test_rerun_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::new(vec![[0, 0, 0]]));
        let env = test_env(dir.path(), launcher, ScriptBook::default());
        let mut case = test_case(TestKind::Fail, test_device("5D3", "aa"), dir.path(), CaseOptions::default());

        case.run(&env).await.unwrap();
        assert_eq!(case.passed(), Some(false));
        assert!(matches!(
            case.run(&env).await,
            Err(Error::InternalConsistency(_))
        ));
    }

    fn menu_book(md5: &str, keys: &[&str]) -> ScriptBook {
        let mut book = ScriptBook::default();
        book.known_roms.insert("5D3".into(), vec![md5.into()]);
        book.menu_sequences
            .insert(md5.into(), keys.iter().map(|k| k.to_string()).collect());
        book
    }

    #[tokio::test]
    async fn test_panicking_body_fails_and_releases_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut launcher = FakeLauncher::new(vec![[0, 0, 0]]);
        launcher.fault = Some(Fault::PanicAt(1));
        let launcher = Arc::new(launcher);
        let log = launcher.log.clone();
        let env = test_env(dir.path(), launcher, menu_book("aa", &["m", "l"]));
        let out = dir.path().join("out");
        let mut case = test_case(TestKind::Menu, test_device("5D3", "aa"), &out, CaseOptions::default());

        case.run(&env).await.unwrap();

        assert_eq!(case.passed(), Some(false));
        assert_eq!(case.fail_reason(), Some("MenuTest: panicked: boom in key_press m"));
        case.check_consistent().unwrap();
        let log = log.lock().unwrap();
        assert!(log.keys.is_empty());
        assert_eq!(log.shutdowns, vec![ShutdownMode::Force]);
        assert_eq!(log.teardowns, 1);
    }

    #[tokio::test]
    async fn test_body_error_becomes_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut launcher = FakeLauncher::new(vec![[0, 0, 0]]);
        launcher.fail_launch = true;
        let launcher = Arc::new(launcher);
        let log = launcher.log.clone();
        let env = test_env(dir.path(), launcher, menu_book("aa", &["m"]));
        let out = dir.path().join("out");
        let mut case = test_case(TestKind::Menu, test_device("5D3", "aa"), &out, CaseOptions::default());

        case.run(&env).await.unwrap();

        assert_eq!(case.passed(), Some(false));
        let reason = case.fail_reason().unwrap();
        assert!(reason.starts_with("MenuTest: Emulator died during startup"), "{}", reason);
        assert!(reason.contains("could not load ROM"), "{}", reason);
        let log = log.lock().unwrap();
        assert_eq!(log.configs.len(), 1);
        // no session was ever handed out, so nothing to stop
        assert!(log.shutdowns.is_empty());
        assert_eq!(log.teardowns, 0);
    }

    #[tokio::test]
    async fn test_existing_output_dir_fails_the_case() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::new(vec![[0, 0, 0]]));
        let env = test_env(dir.path(), launcher, ScriptBook::default());
        let mut case = test_case(TestKind::Fail, test_device("5D3", "aa"), dir.path(), CaseOptions::default());
        std::fs::create_dir_all(case.output_dir()).unwrap();

        case.run(&env).await.unwrap();
        assert_eq!(case.passed(), Some(false));
        assert!(case.fail_reason().unwrap().contains("Couldn't create output dir"));
    }

    #[tokio::test]
    async fn test_disk_images_are_copied_per_case() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("disk_images").join("5D3");
        std::fs::create_dir_all(&images).unwrap();
        std::fs::write(images.join("sd.qcow2"), b"sd").unwrap();
        std::fs::write(images.join("cf.qcow2"), b"cf").unwrap();

        let launcher = Arc::new(FakeLauncher::new(vec![[0, 0, 0]]));
        let env = test_env(dir.path(), launcher, ScriptBook::default());
        let mut device = test_device("5D3", "aa");
        device.has_sd = true;
        device.has_cf = true;
        let out = dir.path().join("out");
        let mut case = test_case(TestKind::Fail, device, &out, CaseOptions::default());

        let images = prepare_output(&case, &env).await.unwrap();
        let run = CaseRun::new(&mut case, &env, images);
        let config = run.session_config(false);
        assert_eq!(config.sd_image, Some(out.join("5D3/FailTest/sd.qcow2")));
        assert_eq!(config.cf_image, Some(out.join("5D3/FailTest/cf.qcow2")));
        assert_eq!(config.work_dir, out.join("5D3/FailTest"));
        assert_eq!(config.capture_prefix, "fail_test_");
        assert_eq!(config.display, DisplaySpec::Headless);
        run.exit().await;

        assert_eq!(std::fs::read(out.join("5D3/FailTest/sd.qcow2")).unwrap(), b"sd");
    }
}
