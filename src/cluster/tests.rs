//! Whole-group runs on real threads.

use std::io::{self, Write};
use std::path::Path;
use std::thread;
use std::time::Duration;

use crossbeam_channel::bounded;
use tempfile::NamedTempFile;

use crate::checker::{Checker, HistorySink, PrintHistory, ViolationKind};
use crate::coordinator::{CoordinatorError, JobFile, JobFileError, Outcome, FAILURE_SIGNAL};
use crate::fabric::{FabricConfig, Rank};
use crate::lock::ReplyPolicy;
use crate::worker::{ConsoleSink, PrintLine, WorkerState};

use super::{run, ClusterError, RunConfig, RunReport};

fn job_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

/// `jobs_each` jobs for every one of `workers` workers, interleaved.
fn generated_jobs(workers: u32, jobs_each: usize) -> String {
    let mut contents = format!("{}\n", workers);
    for i in 0..jobs_each {
        for rank in 1..=workers {
            contents.push_str(&format!("{} job {} for worker {}\n", rank, i, rank));
        }
    }
    contents
}

fn config(path: &Path, processes: u32) -> RunConfig {
    RunConfig {
        job_file: path.to_path_buf(),
        processes,
        policy: ReplyPolicy::RequestOrder,
        fabric: FabricConfig::default(),
    }
}

fn run_recorded(config: &RunConfig, hold: Option<Duration>) -> (RunReport, PrintHistory) {
    let history = PrintHistory::new();
    let report = run(config, |_| {
        let sink = HistorySink::new(history.clone());
        match hold {
            Some(hold) => sink.with_hold(hold),
            None => sink,
        }
    })
    .unwrap();
    (report, history)
}

fn assert_clean_run(path: &Path, report: &RunReport, history: &PrintHistory) {
    assert_eq!(report.exit_status(), 0);
    assert!(matches!(report.coordinator, Outcome::Completed { .. }));
    for worker in &report.workers {
        assert_eq!(worker.state, WorkerState::Terminated, "worker {}", worker.rank);
        assert_eq!(worker.queued, 0);
    }

    let file = JobFile::load(path).unwrap();
    let result = Checker::for_job_file(&file).verify(&history.snapshot());
    assert!(result.passed, "violations: {:?}", result.violations);
    assert_eq!(report.total_printed(), file.jobs.len());
}

#[test]
fn test_full_run_prints_every_job_once() {
    let file = job_file(&generated_jobs(4, 5));
    let (report, history) = run_recorded(&config(file.path(), 5), None);

    assert_clean_run(file.path(), &report, &history);
    assert_eq!(report.workers.len(), 4);
}

#[test]
fn test_single_worker_group() {
    let file = job_file("1\n1 only\n1 worker\n");
    let (report, history) = run_recorded(&config(file.path(), 2), None);

    assert_clean_run(file.path(), &report, &history);
    assert_eq!(history.texts(), vec!["only".to_string(), "worker".to_string()]);
}

#[test]
fn test_idle_workers_still_complete() {
    // Worker 2 gets no jobs at all.
    let file = job_file("3\n1 a\n3 b\n1 c\n");
    let (report, history) = run_recorded(&config(file.path(), 4), None);

    assert_clean_run(file.path(), &report, &history);
    assert_eq!(report.workers[1].printed, 0);
}

#[test]
fn test_process_count_mismatch_aborts_group() {
    let file = job_file("2\n1 a\n2 b\n");
    let (report, history) = run_recorded(&config(file.path(), 2), None);

    match &report.coordinator {
        Outcome::Aborted { reason, signal } => {
            assert_eq!(*signal, 0);
            assert!(matches!(
                reason,
                CoordinatorError::ProcessCountMismatch { needed: 3, actual: 2 }
            ));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(report.exit_status(), 0);
    assert_eq!(report.workers.len(), 1);
    assert_eq!(report.workers[0].state, WorkerState::Error);
    assert_eq!(report.workers[0].abort_signal, Some(0));
    assert!(history.is_empty());
}

#[test]
fn test_unreadable_file_aborts_group() {
    let dir = tempfile::tempdir().unwrap();
    let (report, history) = run_recorded(&config(&dir.path().join("missing"), 3), None);

    assert!(matches!(
        report.coordinator,
        Outcome::Aborted {
            reason: CoordinatorError::JobFile(JobFileError::Unreadable { .. }),
            ..
        }
    ));
    assert!(report.workers.iter().all(|w| w.state == WorkerState::Error));
    assert!(history.is_empty());
}

#[test]
fn test_coordinator_alone() {
    let file = job_file("1\n1 a\n");
    let (report, _) = run_recorded(&config(file.path(), 1), None);

    assert!(matches!(report.coordinator, Outcome::Aborted { .. }));
    assert!(report.workers.is_empty());
}

#[test]
fn test_empty_group_rejected() {
    let file = job_file("1\n");
    let err = run(&config(file.path(), 0), |_| HistorySink::new(PrintHistory::new())).unwrap_err();
    assert!(matches!(err, ClusterError::EmptyGroup));
}

#[test]
fn test_stress_with_jitter_and_bounded_inboxes() {
    let file = job_file(&generated_jobs(5, 8));
    let mut config = config(file.path(), 6);
    config.fabric = FabricConfig {
        inbox_capacity: Some(2),
        jitter: Some((Duration::ZERO, Duration::from_micros(150))),
    };

    for _ in 0..3 {
        let (report, history) = run_recorded(&config, Some(Duration::from_micros(200)));
        assert_clean_run(file.path(), &report, &history);
    }
}

#[test]
fn test_local_clock_policy_still_prints_everything() {
    let file = job_file(&generated_jobs(3, 4));
    let mut config = config(file.path(), 4);
    config.policy = ReplyPolicy::LocalClock;

    let (report, history) = run_recorded(&config, None);
    assert_eq!(report.exit_status(), 0);
    assert_eq!(history.len(), 12);
    assert!(report.workers.iter().all(|w| w.state == WorkerState::Terminated));
}

/// Records like `HistorySink`, except on the broken ranks, whose prints fail
/// with a closed pipe.
struct PartlyBroken {
    history: HistorySink,
    broken: bool,
}

impl ConsoleSink for PartlyBroken {
    fn print(&mut self, line: PrintLine<'_>) -> io::Result<()> {
        if self.broken {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "console closed"));
        }
        self.history.print(line)
    }
}

/// Run in the background and fail the test if the group does not finish.
fn run_with_broken(config: RunConfig, broken: &'static [Rank]) -> (RunReport, PrintHistory) {
    let history = PrintHistory::new();
    let recorded = history.clone();
    let (tx, rx) = bounded(1);

    thread::spawn(move || {
        let report = run(&config, |rank| PartlyBroken {
            history: HistorySink::new(recorded.clone()),
            broken: broken.contains(&rank),
        });
        let _ = tx.send(report);
    });

    let report = rx
        .recv_timeout(Duration::from_secs(10))
        .expect("process group did not finish after a worker failed")
        .unwrap();
    (report, history)
}

fn assert_failed_run(report: &RunReport) {
    match &report.coordinator {
        Outcome::Aborted { reason, signal } => {
            assert_eq!(*signal, FAILURE_SIGNAL);
            assert!(matches!(reason, CoordinatorError::WorkerFailed { .. }));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(report.exit_status(), 1);
    for worker in &report.workers {
        assert_eq!(worker.state, WorkerState::Error, "worker {}", worker.rank);
        assert_eq!(worker.abort_signal, Some(FAILURE_SIGNAL));
    }
}

#[test]
fn test_console_failure_on_every_worker_ends_group() {
    let file = job_file("2\n1 a\n2 b\n");
    let (report, history) = run_with_broken(config(file.path(), 3), &[1, 2]);

    assert_failed_run(&report);
    assert_eq!(report.total_printed(), 0);
    assert!(history.is_empty());
}

#[test]
fn test_console_failure_on_one_worker_ends_group() {
    let file = job_file(&generated_jobs(3, 4));
    let mut config = config(file.path(), 4);
    config.fabric = FabricConfig {
        inbox_capacity: Some(1),
        jitter: Some((Duration::ZERO, Duration::from_micros(100))),
    };

    let (report, history) = run_with_broken(config, &[2]);

    assert_failed_run(&report);
    assert_eq!(report.workers[1].printed, 0);
    // Whatever got printed before the abort still printed alone.
    let result = Checker::silent().verify(&history.snapshot());
    assert!(
        result.violations.iter().all(|v| v.kind != ViolationKind::Overlap),
        "violations: {:?}",
        result.violations
    );
}
