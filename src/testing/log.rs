//! LogTest: check the emulator log for signs of healthy emulation
//!
//! This isn't a comparison against an exact log. The expected strings only
//! have to appear in order somewhere in stderr.

use crate::common::{Error, Result};
use crate::emulator::ShutdownMode;

use super::case::CaseRun;

const STDOUT_FILE: &str = "qemu.stdout";
const STDERR_FILE: &str = "qemu.stderr";

/// First expected substring not found in order in `log`, if any
///
/// Each item is searched for after the end of the previous match, so items
/// may share a line but never overlap or go backwards.
pub fn first_unmatched<'a>(log: &str, expected: &'a [String]) -> Option<&'a str> {
    let mut pos = 0;
    for want in expected {
        match log[pos..].find(want.as_str()) {
            Some(idx) => pos += idx + want.len(),
            None => return Some(want.as_str()),
        }
    }
    None
}

pub(super) async fn run(run: &mut CaseRun<'_>) -> Result<()> {
    let model = run.case().device().model.clone();
    let md5 = run.case().device().code_rom_md5().to_string();

    if run.case().options().verbose {
        run.env()
            .console
            .line(format!("LogTest starting on {} {}", model, md5));
    }

    if let Err(reason) = run.scripts().check_known(&model, &md5) {
        run.fail(reason).await?;
        return Ok(());
    }
    let Some(expected) = run.scripts().log_lines(&md5).map(<[String]>::to_vec) else {
        run.fail(format!("Unknown rom for LogTest, MD5 sum: {}", md5))
            .await?;
        return Ok(());
    };

    let settle = run.env().config.timeouts.log_settle();

    // Output must be captured, never passed through
    run.start_session(false).await?;
    let (stdout, stderr) = {
        let session = run
            .session()
            .ok_or_else(|| Error::Internal("LogTest lost its session".into()))?;
        tokio::time::sleep(settle).await;
        session.shutdown(ShutdownMode::Graceful).await?;
        (session.stdout_text()?, session.stderr_text()?)
    };

    let dir = run.output_dir().to_path_buf();
    tokio::fs::write(dir.join(STDOUT_FILE), &stdout).await?;
    tokio::fs::write(dir.join(STDERR_FILE), &stderr).await?;

    // qemu doesn't use stdout at all
    if !stdout.is_empty() {
        run.fail(format!("Stdout was non-empty.  Content: \n\n{}", stdout))
            .await?;
        return Ok(());
    }

    match first_unmatched(&stderr, &expected) {
        None => {
            run.succeed().await?;
        }
        Some(missing) => {
            run.fail(format!(
                "Not all expected lines found in Qemu output.  First missing line:\n{}\n",
                missing
            ))
            .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::case::tests::{test_case, test_device, test_env};
    use super::super::case::{CaseOptions, TestKind};
    use super::super::scripts::ScriptBook;
    use super::*;
    use crate::emulator::fake::FakeLauncher;
    use std::sync::Arc;

    const H1: &str = "2222bbbb";

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_in_order_lines_match() {
        let log = "boot\nK285 READY\nnoise\nK285 ICU Firmware Version 1.2.3\n[STARTUP] startupInitializeComplete\n";
        let expected = lines(&["K285 READY", "ICU Firmware", "startupInitializeComplete"]);
        assert_eq!(first_unmatched(log, &expected), None);
    }

    #[test]
    fn test_out_of_order_reports_first_pending() {
        let log = "[STARTUP] startupInitializeComplete\nK285 READY\n";
        let expected = lines(&["K285 READY", "startupInitializeComplete"]);
        assert_eq!(first_unmatched(log, &expected), Some("startupInitializeComplete"));
    }

    #[test]
    fn test_items_may_share_a_line_in_order() {
        let expected = lines(&["A", "B"]);
        assert_eq!(first_unmatched("A B\n", &expected), None);
        assert_eq!(first_unmatched("B A\n", &expected), Some("B"));
    }

    #[test]
    fn test_gaps_between_matches_are_ignored() {
        let expected = lines(&["READY", "STARTUP"]);
        assert_eq!(first_unmatched("... READY ... other ... STARTUP ...", &expected), None);
        assert_eq!(first_unmatched("STARTUP ... READY", &expected), Some("STARTUP"));
    }

    #[test]
    fn test_matches_never_overlap() {
        let expected = lines(&["READY", "READY"]);
        assert_eq!(first_unmatched("K285 READY\n", &expected), Some("READY"));
        assert_eq!(first_unmatched("READY\nREADY\n", &expected), None);
    }

    #[test]
    fn test_nothing_expected_always_matches() {
        assert_eq!(first_unmatched("", &[]), None);
        assert_eq!(first_unmatched("", &lines(&["x"])), Some("x"));
    }

    fn book(expected: &[&str]) -> ScriptBook {
        let mut book = ScriptBook::default();
        book.known_roms.insert("5D3".into(), vec![H1.into()]);
        book.log_lines.insert(H1.into(), lines(expected));
        book
    }

    #[tokio::test]
    async fn test_log_case_writes_output_and_passes() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let mut launcher = FakeLauncher::new(vec![[0, 0, 0]]);
        launcher.stderr = "K285 READY\nK285 ICU Firmware Version 1.2.3 ( 9.0.1 )\n".into();
        let launcher = Arc::new(launcher);
        let log = launcher.log.clone();
        let env = test_env(dir.path(), launcher, book(&["K285 READY", "ICU Firmware"]));
        let options = CaseOptions {
            verbose: true,
            force_continue: false,
        };
        let mut case = test_case(TestKind::Log, test_device("5D3", H1), &out, options);

        case.run(&env).await.unwrap();

        assert_eq!(case.passed(), Some(true), "{:?}", case.fail_reason());
        let stderr = std::fs::read_to_string(case.output_dir().join("qemu.stderr")).unwrap();
        assert!(stderr.contains("K285 READY"));
        assert_eq!(std::fs::read_to_string(case.output_dir().join("qemu.stdout")).unwrap(), "");

        let log = log.lock().unwrap();
        assert!(!log.configs[0].verbose);
        assert_eq!(log.shutdowns, vec![ShutdownMode::Graceful]);
    }

    #[tokio::test]
    async fn test_non_empty_stdout_fails() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let mut launcher = FakeLauncher::new(vec![[0, 0, 0]]);
        launcher.stdout = "unexpected".into();
        let env = test_env(dir.path(), Arc::new(launcher), book(&[]));
        let mut case = test_case(TestKind::Log, test_device("5D3", H1), &out, CaseOptions::default());

        case.run(&env).await.unwrap();

        assert!(case
            .fail_reason()
            .unwrap()
            .starts_with("LogTest: Stdout was non-empty"));
    }

    #[tokio::test]
    async fn test_missing_line_named_in_reason() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let mut launcher = FakeLauncher::new(vec![[0, 0, 0]]);
        launcher.stderr = "K285 READY\n".into();
        let env = test_env(dir.path(), Arc::new(launcher), book(&["K285 READY", "startupInitializeComplete"]));
        let mut case = test_case(TestKind::Log, test_device("5D3", H1), &out, CaseOptions::default());

        case.run(&env).await.unwrap();

        let reason = case.fail_reason().unwrap();
        assert!(reason.contains("First missing line:\nstartupInitializeComplete"), "{}", reason);
    }
}
