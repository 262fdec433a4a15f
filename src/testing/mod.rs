//! Test cases, their variants and the parallel orchestrator
//!
//! A run resolves every requested cam, creates one [`TestCase`] per
//! applicable test group, and executes them on a worker pool. Each case owns
//! its emulator session for exactly the duration of its run.

mod case;
mod fail;
mod log;
mod menu;
mod orchestrator;
mod scripts;

pub use case::{CaseOptions, CaseRun, JobSlots, RunEnv, TestCase, TestGroup, TestKind};
pub use log::first_unmatched;
pub use orchestrator::{
    prepare_output_root, worker_count, CaseReport, DeviceSummary, Orchestrator, RunPolicy,
    RunRequest, RunSummary, TestPlan, SUMMARY_FILE,
};
pub use scripts::{KeyStep, ScriptBook};
