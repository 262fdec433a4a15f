//! FailTest: always fails, for checking failure reporting end to end

use crate::common::Result;

use super::case::CaseRun;

pub(super) async fn run(run: &mut CaseRun<'_>) -> Result<()> {
    if run.case().options().verbose {
        let device = run.case().device();
        run.env().console.line(format!(
            "FailTest starting on {} {}",
            device.model,
            device.code_rom_md5()
        ));
    }
    run.fail("FailTest always fails").await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::case::tests::{test_case, test_device, test_env};
    use super::super::case::{CaseOptions, TestKind};
    use super::super::scripts::ScriptBook;
    use crate::emulator::fake::FakeLauncher;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fail_test_fails_without_emulator() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::new(vec![[0, 0, 0]]));
        let log = launcher.log.clone();
        let env = test_env(dir.path(), launcher, ScriptBook::default());
        let mut case = test_case(TestKind::Fail, test_device("60D", "aa"), dir.path(), CaseOptions::default());

        case.run(&env).await.unwrap();

        assert_eq!(case.passed(), Some(false));
        assert_eq!(case.fail_reason(), Some("FailTest: FailTest always fails"));
        assert!(log.lock().unwrap().configs.is_empty());
        assert!(case.output_dir().is_dir());
    }
}
