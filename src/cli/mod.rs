//! CLI command handling
//!
//! Validates arguments, builds the run environment and hands off to the
//! orchestrator.

use std::path::Path;
use std::sync::Arc;

use colored::Colorize;

use crate::commands::{Commands, RunArgs};
use crate::common::{logging, Config, Console, Error, Result};
use crate::device::{resolve_device, supported_models};
use crate::emulator::QemuLauncher;
use crate::testing::{
    prepare_output_root, Orchestrator, RunEnv, RunPolicy, RunRequest, RunSummary, ScriptBook,
};

/// Dispatch a CLI command; returns whether everything passed
pub async fn dispatch(command: Commands) -> Result<bool> {
    match command {
        Commands::Run(args) => run(args).await.map(|summary| summary.passed),
        Commands::Devices { cams, rom_dir } => {
            logging::init_cli(false);
            devices(&cams, &rom_dir)
        }
    }
}

fn require_dir(path: &Path, what: &str) -> Result<()> {
    if !path.is_dir() {
        return Err(Error::Config(format!(
            "{} didn't exist / couldn't be accessed: {}",
            what,
            path.display()
        )));
    }
    Ok(())
}

fn all_cams(cams: &[String]) -> Vec<String> {
    if cams.is_empty() {
        supported_models().into_iter().map(str::to_string).collect()
    } else {
        cams.to_vec()
    }
}

async fn run(args: RunArgs) -> Result<RunSummary> {
    require_dir(&args.rom_dir, "rom_dir")?;
    require_dir(&args.emulator_dir, "emulator_dir")?;

    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let scripts = ScriptBook::with_overrides(args.scripts.as_deref())?;

    prepare_output_root(&args.output_dir)?;
    // The emulator runs inside the case dirs, so paths handed to it must be absolute
    let output_root = args.output_dir.canonicalize()?;
    let _guard = logging::init_run(args.verbose, &output_root);

    let emulator_dir = args
        .emulator_dir
        .canonicalize()
        .unwrap_or_else(|_| args.emulator_dir.clone());
    let env = RunEnv {
        config,
        launcher: Arc::new(QemuLauncher),
        scripts,
        console: Console::new(),
        emulator_dir,
    };

    let request = RunRequest {
        models: all_cams(&args.cams),
        groups: args.tests.clone(),
        rom_dir: args.rom_dir.clone(),
        output_root,
        expected_root: args.expected_dir.clone(),
        policy: RunPolicy {
            fail_early: !args.no_fail_early,
            force_continue: args.force_continue,
            verbose: args.verbose,
        },
        jobs: args.jobs,
    };
    tracing::info!(
        "Testing {} cams, output in {}",
        request.models.len(),
        request.output_root.display()
    );

    Orchestrator::new(env).run(&request).await
}

fn devices(cams: &[String], rom_dir: &Path) -> Result<bool> {
    let config = Config::load()?;
    let mut all_ok = true;
    for model in all_cams(cams) {
        let unreliable = config.devices.unreliable_screencaps.contains(&model);
        match resolve_device(&model, rom_dir, unreliable) {
            Ok(device) => println!("{}", device),
            Err(e) => {
                all_ok = false;
                println!("{} {}: {}", "FAIL".red().bold(), model, e);
            }
        }
    }
    Ok(all_ok)
}
