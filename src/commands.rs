//! CLI command definitions
//!
//! Defines the clap commands for the eos-test CLI.

use clap::{Args, Subcommand};
use std::path::PathBuf;

use crate::testing::TestGroup;

#[derive(Subcommand)]
pub enum Commands {
    /// Run regression tests against emulated cams
    Run(RunArgs),

    /// Resolve cams and show what the harness knows about them
    Devices {
        /// Cams to describe; defaults to every supported cam
        cams: Vec<String>,

        /// Dir holding one ROM subdir per cam
        #[arg(long, short = 'r', default_value = "roms")]
        rom_dir: PathBuf,
    },
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Which cams to test, e.g. 50D 200D; defaults to all supported cams
    pub cams: Vec<String>,

    /// Dir holding one ROM subdir per cam
    #[arg(long, short = 'r', default_value = "roms")]
    pub rom_dir: PathBuf,

    /// qemu-eos install dir (binary and disk images)
    #[arg(long, short = 'q', default_value = ".")]
    pub emulator_dir: PathBuf,

    /// Test groups to run, defaults to menu and log
    #[arg(long, short = 't', value_enum, value_delimiter = ',')]
    pub tests: Vec<TestGroup>,

    /// Where test output goes; must not exist yet
    #[arg(long, short = 'o', default_value = "test_output")]
    pub output_dir: PathBuf,

    /// Golden reference root, laid out as <model>/<TestClass>/
    #[arg(long, short = 'e', default_value = "expected_test_output")]
    pub expected_dir: PathBuf,

    /// Keep starting tests after the first failure
    #[arg(long)]
    pub no_fail_early: bool,

    /// Run every test to the end despite failures, e.g. to collect new
    /// reference screenshots. Tests still report failure.
    #[arg(long)]
    pub force_continue: bool,

    /// Show emulator output and debug logging
    #[arg(long, short)]
    pub verbose: bool,

    /// Config file; defaults to the user config dir
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// YAML file extending the built-in key scripts and expected log lines
    #[arg(long, short = 's')]
    pub scripts: Option<PathBuf>,

    /// Number of parallel workers
    #[arg(long, short = 'j')]
    pub jobs: Option<usize>,
}
