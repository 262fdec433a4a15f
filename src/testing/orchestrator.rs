//! Parallel test orchestration
//!
//! Devices are resolved up front; every resolved device gets one case per
//! applicable test group. Cases are handed to a pool of worker tasks by value
//! over a shared queue and come back over a results channel, so the
//! orchestrator owns the only collection of cases. After the pool is joined
//! the results are checked for consistency before anything is reported.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use colored::Colorize;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};

use crate::common::{paths, Console, Error, Result};
use crate::device::{resolve_device, Device};

use super::case::{CaseOptions, JobSlots, RunEnv, TestCase, TestGroup};

/// Name of the machine-readable summary in the output root
pub const SUMMARY_FILE: &str = "summary.json";

/// Run-wide switches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunPolicy {
    /// Stop starting new cases after the first failure
    pub fail_early: bool,
    pub force_continue: bool,
    pub verbose: bool,
}

/// What to test and where
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub models: Vec<String>,
    pub groups: Vec<TestGroup>,
    pub rom_dir: PathBuf,
    pub output_root: PathBuf,
    pub expected_root: PathBuf,
    pub policy: RunPolicy,
    /// Worker count override
    pub jobs: Option<usize>,
}

/// Cases to execute plus the devices that never got that far
#[derive(Debug, Default)]
pub struct TestPlan {
    /// Requested models, deduplicated, in request order
    pub models: Vec<String>,
    pub cases: Vec<TestCase>,
    /// Model -> reason it couldn't be tested
    pub preflight_failures: BTreeMap<String, String>,
}

impl TestPlan {
    /// Number of queued cases per model
    pub fn queued_counts(&self) -> BTreeMap<String, usize> {
        let mut counts: BTreeMap<String, usize> =
            self.models.iter().map(|m| (m.clone(), 0)).collect();
        for case in &self.cases {
            *counts.entry(case.device().model.clone()).or_default() += 1;
        }
        counts
    }
}

/// Verdict of one case in the summary
#[derive(Debug, Clone, Serialize)]
pub struct CaseReport {
    pub class: String,
    pub job_id: u32,
    pub passed: Option<bool>,
    pub skipped: bool,
    pub fail_reason: Option<String>,
    pub output_dir: PathBuf,
}

impl CaseReport {
    fn from_case(case: &TestCase, skipped: bool) -> Self {
        Self {
            class: case.class_name().to_string(),
            job_id: case.job_id(),
            passed: case.passed(),
            skipped,
            fail_reason: case.fail_reason().map(str::to_string),
            output_dir: case.output_dir().to_path_buf(),
        }
    }
}

/// Per-device outcome
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub model: String,
    pub passed: bool,
    pub preflight_failure: Option<String>,
    pub queued: usize,
    pub finished: usize,
    pub skipped: usize,
    pub cases: Vec<CaseReport>,
}

/// Outcome of a whole run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub passed: bool,
    pub aborted: bool,
    pub devices: Vec<DeviceSummary>,
}

impl RunSummary {
    pub fn write_json(&self, output_root: &Path) -> Result<PathBuf> {
        let path = output_root.join(SUMMARY_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }

    /// Print the final per-device summary
    pub fn print(&self, console: &Console) {
        console.line(format!("\n{}", "Summary:".blue().bold()));
        for device in &self.devices {
            let verdict = if device.passed {
                "PASS".green().bold()
            } else {
                "FAIL".red().bold()
            };
            match &device.preflight_failure {
                Some(reason) => console.line(format!("  {} {}: {}", verdict, device.model, reason)),
                None => console.line(format!(
                    "  {} {} ({} of {} run{})",
                    verdict,
                    device.model,
                    device.finished,
                    device.queued,
                    if device.skipped > 0 {
                        format!(", {} skipped", device.skipped)
                    } else {
                        String::new()
                    }
                )),
            }
            for case in device.cases.iter().filter(|c| c.passed != Some(true)) {
                if case.skipped {
                    console.line(format!("      {} {}", case.class, "skipped".yellow()));
                } else if let Some(reason) = &case.fail_reason {
                    console.line(format!("      {}", reason.dimmed()));
                }
            }
        }
        if self.aborted {
            console.line(format!("{}", "Run aborted after first failure (--fail-early)".yellow()));
        }
    }
}

/// Create the output root, which must not exist yet
pub fn prepare_output_root(path: &Path) -> Result<()> {
    if path.exists() {
        return Err(Error::Config(format!(
            "Output dir already exists, not overwriting: {}",
            path.display()
        )));
    }
    std::fs::create_dir_all(path)?;
    Ok(())
}

/// Workers to spawn: one core is left for the harness itself
pub fn worker_count(jobs: Option<usize>, cases: usize) -> usize {
    let wanted = jobs.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2)
            .saturating_sub(1)
    });
    wanted.max(1).min(cases.max(1))
}

enum WorkItem {
    Case(usize, Box<TestCase>),
    Stop,
}

enum WorkResult {
    Finished(usize, Box<TestCase>),
    /// Claimed after the abort flag went up, returned unrun
    Skipped(usize, Box<TestCase>),
    /// Harness bug reported by a case
    Fatal(Error),
}

pub struct Orchestrator {
    env: Arc<RunEnv>,
}

impl Orchestrator {
    pub fn new(env: RunEnv) -> Self {
        Self { env: Arc::new(env) }
    }

    /// Resolve devices and create their cases, numbering jobs from 0
    pub fn plan(&self, request: &RunRequest) -> TestPlan {
        let mut plan = TestPlan::default();
        let groups = if request.groups.is_empty() {
            TestGroup::defaults()
        } else {
            request.groups.clone()
        };
        let options = CaseOptions {
            verbose: request.policy.verbose,
            force_continue: request.policy.force_continue,
        };

        let mut job_id = 0u32;
        for model in &request.models {
            if plan.models.contains(model) {
                tracing::warn!("Ignoring repeated cam: {}", model);
                continue;
            }
            plan.models.push(model.clone());

            let unreliable = self.env.config.devices.unreliable_screencaps.contains(model);
            let device = match resolve_device(model, &request.rom_dir, unreliable) {
                Ok(device) => device,
                Err(e) => {
                    tracing::warn!("Couldn't resolve {}: {}", model, e);
                    plan.preflight_failures.insert(model.clone(), e.to_string());
                    continue;
                }
            };
            tracing::debug!("Resolved {}", device);

            let applicable: Vec<TestGroup> = groups
                .iter()
                .copied()
                .filter(|g| g.applies_to(&device))
                .collect();
            if applicable.is_empty() {
                plan.preflight_failures.insert(
                    model.clone(),
                    "None of the requested tests apply to this cam".to_string(),
                );
                continue;
            }

            for group in applicable {
                let slots = JobSlots::for_job(job_id, &self.env.config.ports);
                plan.cases.push(new_case(
                    group,
                    device.clone(),
                    slots,
                    request,
                    options,
                ));
                job_id += 1;
            }
        }
        plan
    }

    /// Run every planned case on the worker pool and aggregate the results
    pub async fn execute(&self, plan: TestPlan, policy: RunPolicy, jobs: Option<usize>) -> Result<RunSummary> {
        let queued = plan.queued_counts();
        let TestPlan {
            models,
            cases,
            preflight_failures,
        } = plan;

        let workers = if cases.is_empty() {
            0
        } else {
            worker_count(jobs, cases.len())
        };
        if workers > 0 {
            paths::ensure_socket_dir()?;
        }
        tracing::info!("Running {} cases on {} workers", cases.len(), workers);

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        for (index, case) in cases.into_iter().enumerate() {
            send_item(&queue_tx, WorkItem::Case(index, Box::new(case)))?;
        }
        for _ in 0..workers {
            send_item(&queue_tx, WorkItem::Stop)?;
        }
        drop(queue_tx);

        let queue = Arc::new(Mutex::new(queue_rx));
        let (result_tx, mut result_rx) = mpsc::unbounded_channel();
        let abort = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            handles.push(tokio::spawn(worker(
                worker_id,
                self.env.clone(),
                queue.clone(),
                result_tx.clone(),
                abort.clone(),
                policy.fail_early,
            )));
        }
        drop(result_tx);

        for handle in handles {
            handle
                .await
                .map_err(|e| Error::Internal(format!("worker task failed: {}", e)))?;
        }

        let mut finished = Vec::new();
        let mut skipped = Vec::new();
        while let Some(result) = result_rx.recv().await {
            match result {
                WorkResult::Finished(index, case) => finished.push((index, *case)),
                WorkResult::Skipped(index, case) => skipped.push((index, *case)),
                WorkResult::Fatal(e) => return Err(e),
            }
        }
        // Whatever no worker claimed
        let mut rest = queue.lock().await;
        while let Ok(item) = rest.try_recv() {
            if let WorkItem::Case(index, case) = item {
                skipped.push((index, *case));
            }
        }

        finished.sort_by_key(|(index, _)| *index);
        skipped.sort_by_key(|(index, _)| *index);

        aggregate(
            &models,
            &queued,
            finished.into_iter().map(|(_, c)| c).collect(),
            skipped.into_iter().map(|(_, c)| c).collect(),
            &preflight_failures,
            abort.load(Ordering::SeqCst),
        )
    }

    /// Plan, execute, report, and write `summary.json`
    pub async fn run(&self, request: &RunRequest) -> Result<RunSummary> {
        let plan = self.plan(request);
        for (model, reason) in &plan.preflight_failures {
            self.env
                .console
                .line(format!("{}: {} {}", "FAIL".red().bold(), model, reason));
        }

        let summary = self.execute(plan, request.policy, request.jobs).await?;
        summary.print(&self.env.console);
        let path = summary.write_json(&request.output_root)?;
        tracing::info!("Summary written to {}", path.display());
        Ok(summary)
    }
}

fn new_case(
    group: TestGroup,
    device: Device,
    slots: JobSlots,
    request: &RunRequest,
    options: CaseOptions,
) -> TestCase {
    TestCase::new(
        group.kind(),
        device,
        slots,
        &request.output_root,
        &request.expected_root,
        options,
    )
}

fn send_item(tx: &mpsc::UnboundedSender<WorkItem>, item: WorkItem) -> Result<()> {
    tx.send(item)
        .map_err(|_| Error::Internal("work queue closed early".into()))
}

async fn worker(
    worker_id: usize,
    env: Arc<RunEnv>,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<WorkItem>>>,
    results: mpsc::UnboundedSender<WorkResult>,
    abort: Arc<AtomicBool>,
    fail_early: bool,
) {
    loop {
        if abort.load(Ordering::SeqCst) {
            break;
        }
        let item = queue.lock().await.recv().await;
        let (index, mut case) = match item {
            Some(WorkItem::Case(index, case)) => (index, case),
            Some(WorkItem::Stop) | None => break,
        };

        if abort.load(Ordering::SeqCst) {
            let _ = results.send(WorkResult::Skipped(index, case));
            break;
        }

        tracing::debug!(
            "worker {} running {} {} (job {})",
            worker_id,
            case.class_name(),
            case.device().model,
            case.job_id()
        );
        if let Err(e) = case.run(&env).await {
            let _ = results.send(WorkResult::Fatal(e));
            abort.store(true, Ordering::SeqCst);
            break;
        }

        report_case(&env.console, &case);
        if fail_early && case.passed() == Some(false) {
            abort.store(true, Ordering::SeqCst);
        }
        let _ = results.send(WorkResult::Finished(index, case));
    }
}

fn report_case(console: &Console, case: &TestCase) {
    match case.passed() {
        Some(true) => console.line(format!(
            "{}: {}, {}",
            "PASS".green().bold(),
            case.class_name(),
            case.device().model
        )),
        _ => console.line(format!(
            "{}: {}, {}\n\t{}",
            "FAIL".red().bold(),
            case.class_name(),
            case.device().model,
            case.fail_reason().unwrap_or("no reason given")
        )),
    }
}

/// Check the finished cases against what was queued and build the summary
///
/// Any disagreement is a harness bug and fails the whole run.
pub(crate) fn aggregate(
    models: &[String],
    queued: &BTreeMap<String, usize>,
    finished: Vec<TestCase>,
    skipped: Vec<TestCase>,
    preflight_failures: &BTreeMap<String, String>,
    aborted: bool,
) -> Result<RunSummary> {
    for case in &finished {
        case.check_consistent()?;
    }
    if !aborted && !skipped.is_empty() {
        return Err(Error::consistency(format!(
            "{} cases skipped without an abort",
            skipped.len()
        )));
    }

    let mut devices = Vec::with_capacity(models.len());
    for model in models {
        let queued_here = queued.get(model).copied().unwrap_or(0);
        let finished_here: Vec<&TestCase> =
            finished.iter().filter(|c| &c.device().model == model).collect();
        let skipped_here: Vec<&TestCase> =
            skipped.iter().filter(|c| &c.device().model == model).collect();

        if finished_here.len() + skipped_here.len() != queued_here {
            return Err(Error::consistency(format!(
                "{}: {} cases queued but {} finished and {} skipped",
                model,
                queued_here,
                finished_here.len(),
                skipped_here.len()
            )));
        }

        let preflight_failure = preflight_failures.get(model).cloned();
        let passed = preflight_failure.is_none()
            && queued_here > 0
            && skipped_here.is_empty()
            && finished_here.iter().all(|c| c.passed() == Some(true));

        let mut cases: Vec<CaseReport> = finished_here
            .iter()
            .map(|c| CaseReport::from_case(c, false))
            .collect();
        cases.extend(skipped_here.iter().map(|c| CaseReport::from_case(c, true)));

        devices.push(DeviceSummary {
            model: model.clone(),
            passed,
            preflight_failure,
            queued: queued_here,
            finished: finished_here.len(),
            skipped: skipped_here.len(),
            cases,
        });
    }

    let accounted: usize = devices.iter().map(|d| d.finished + d.skipped).sum();
    if accounted != finished.len() + skipped.len() {
        return Err(Error::consistency(format!(
            "{} cases returned for devices that were never requested",
            finished.len() + skipped.len() - accounted
        )));
    }

    Ok(RunSummary {
        passed: devices.iter().all(|d| d.passed),
        aborted,
        devices,
    })
}
