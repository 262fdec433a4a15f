//! MenuTest: step through the Canon menus and compare every screen
//!
//! ML is not active. Each key press is followed by a capture that must match
//! the reference of the same name pixel for pixel.

use crate::common::{Error, Result};
use crate::emulator::ShutdownMode;

use super::case::CaseRun;

pub(super) async fn run(run: &mut CaseRun<'_>) -> Result<()> {
    let model = run.case().device().model.clone();
    let md5 = run.case().device().code_rom_md5().to_string();
    let options = run.case().options();

    if options.verbose {
        run.env()
            .console
            .line(format!("MenuTest starting on {} {}", model, md5));
    }

    if let Err(reason) = run.scripts().check_known(&model, &md5) {
        run.fail(reason).await?;
        return Ok(());
    }
    let Some(script) = run.scripts().menu_script(&md5) else {
        run.fail(format!("Unknown rom for MenuTest, MD5 sum: {}", md5))
            .await?;
        return Ok(());
    };

    let timeouts = run.env().config.timeouts.clone();
    let expected_dir = run.case().expected_dir().to_path_buf();
    run.start_session(options.verbose).await?;

    for step in &script {
        let delay = if step.slow {
            timeouts.slow_capture_delay()
        } else {
            timeouts.capture_delay()
        };

        let outcome = {
            let session = run
                .session()
                .ok_or_else(|| Error::Internal("MenuTest lost its session".into()))?;
            session.key_press(&step.key).await?;
            session
                .expect_screen(&expected_dir, timeouts.expect_screen(), delay)
                .await
        };

        match outcome {
            Ok(m) if m.matched => {
                tracing::debug!("{} {}: matched {}", model, step.key, m.capture.name);
            }
            Ok(m) => {
                let reason = format!(
                    "Qemu screen never matched expected result at capture index {}: {}",
                    m.capture.seq, m.capture.name
                );
                if !options.force_continue {
                    run.fail(reason).await?;
                    return Ok(());
                }
                tracing::info!("{} (continuing)", reason);
            }
            Err(Error::MissingReference(path)) => {
                let reason = format!("Missing expected output file: {}", path.display());
                if !options.force_continue {
                    run.fail(reason).await?;
                    return Ok(());
                }
                tracing::info!("{} (continuing)", reason);
            }
            Err(e) => return Err(e),
        }
    }

    if let Some(session) = run.session() {
        session.shutdown(ShutdownMode::Graceful).await?;
    }
    run.succeed().await?;
    Ok(())
}
