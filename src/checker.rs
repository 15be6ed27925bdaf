//! Print history and output checker.
//!
//! Records every print made through the console and verifies it afterwards:
//! - No Overlap: no two prints' time intervals intersect
//! - Exactly Once: every expected job is printed once, and nothing else is
//! - Intake Order: each worker prints its jobs in the order it received them
//! - No Time Travel: a worker's printed clock never decreases

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use crate::coordinator::JobFile;
use crate::fabric::Rank;
use crate::worker::{ConsoleSink, PrintLine};

/// One completed print.
#[derive(Debug, Clone)]
pub struct PrintRecord {
    /// World rank of the printing worker.
    pub rank: Rank,
    /// Clock value printed with the job.
    pub clock: u64,
    pub text: String,
    /// When the print began.
    pub started: Instant,
    /// When the print finished.
    pub finished: Instant,
}

/// Thread-safe, append-only print log shared by every worker's sink.
#[derive(Debug, Clone, Default)]
pub struct PrintHistory {
    inner: Arc<Mutex<Vec<PrintRecord>>>,
}

impl PrintHistory {
    /// Empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one print.
    pub fn record(&self, record: PrintRecord) {
        self.entries().push(record);
    }

    /// Copy of all records, in the order they were appended.
    pub fn snapshot(&self) -> Vec<PrintRecord> {
        self.entries().to_vec()
    }

    /// Number of prints recorded.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Printed texts in append order.
    pub fn texts(&self) -> Vec<String> {
        self.entries().iter().map(|r| r.text.clone()).collect()
    }

    fn entries(&self) -> MutexGuard<'_, Vec<PrintRecord>> {
        // A panicking worker cannot leave a half-written record behind.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Console sink that appends to a [`PrintHistory`].
///
/// An optional hold keeps each print open for a while, widening the window
/// in which an overlapping print would be caught.
#[derive(Debug, Clone)]
pub struct HistorySink {
    history: PrintHistory,
    hold: Option<Duration>,
}

impl HistorySink {
    /// Sink that records into `history` without holding.
    pub fn new(history: PrintHistory) -> Self {
        HistorySink { history, hold: None }
    }

    /// Keep every print open for `hold` before it is recorded as finished.
    pub fn with_hold(mut self, hold: Duration) -> Self {
        self.hold = Some(hold);
        self
    }
}

impl ConsoleSink for HistorySink {
    fn print(&mut self, line: PrintLine<'_>) -> io::Result<()> {
        let started = Instant::now();
        if let Some(hold) = self.hold {
            thread::sleep(hold);
        }
        self.history.record(PrintRecord {
            rank: line.rank,
            clock: line.clock,
            text: line.text.to_string(),
            started,
            finished: Instant::now(),
        });
        Ok(())
    }
}

/// Result of a check.
#[derive(Debug, Clone)]
pub struct CheckResult {
    /// Whether all checks passed.
    pub passed: bool,
    pub violations: Vec<Violation>,
    pub stats: CheckStats,
}

/// A single violation.
#[derive(Debug, Clone)]
pub struct Violation {
    pub kind: ViolationKind,
    pub description: String,
    /// Indices of the records involved.
    pub related_entries: Vec<usize>,
}

/// Type of violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    /// Two prints were in progress at the same time.
    Overlap,
    /// A job was printed more than once.
    Duplicate,
    /// An expected job was never printed.
    Missing,
    /// A print matched no expected job.
    Unexpected,
    /// A worker printed its jobs out of intake order.
    FifoOrder,
    /// A worker's printed clock went backwards.
    ClockRegression,
}

/// Counts gathered while checking.
#[derive(Debug, Clone, Default)]
pub struct CheckStats {
    pub total_prints: usize,
    pub expected_prints: usize,
    /// Prints per worker rank.
    pub per_worker: HashMap<Rank, usize>,
}

/// Verifies a print history against the jobs that were handed out.
pub struct Checker {
    /// Expected texts per worker, in intake order.
    expected: HashMap<Rank, Vec<String>>,
}

impl Checker {
    /// Expect the given texts per worker rank, in intake order.
    pub fn new(expected: HashMap<Rank, Vec<String>>) -> Self {
        Checker { expected }
    }

    /// Expect exactly the jobs of a job file.
    pub fn for_job_file(file: &JobFile) -> Self {
        let mut expected: HashMap<Rank, Vec<String>> = HashMap::new();
        for job in &file.jobs {
            expected.entry(job.rank).or_default().push(job.text.clone());
        }
        Checker { expected }
    }

    /// Expect no output at all.
    pub fn silent() -> Self {
        Checker {
            expected: HashMap::new(),
        }
    }

    /// Run every check over `records`, given in append order.
    pub fn verify(&self, records: &[PrintRecord]) -> CheckResult {
        let mut violations = Vec::new();
        let mut stats = CheckStats {
            total_prints: records.len(),
            expected_prints: self.expected.values().map(Vec::len).sum(),
            ..CheckStats::default()
        };

        self.check_overlap(records, &mut violations);

        let mut by_worker: HashMap<Rank, Vec<usize>> = HashMap::new();
        for (idx, record) in records.iter().enumerate() {
            by_worker.entry(record.rank).or_default().push(idx);
        }

        for (&rank, indices) in &by_worker {
            stats.per_worker.insert(rank, indices.len());
            self.check_clocks(records, indices, &mut violations);
            self.check_worker_output(rank, records, indices, &mut violations);
        }

        for (&rank, texts) in &self.expected {
            let printed = by_worker.get(&rank).map_or(0, Vec::len);
            if printed < texts.len() {
                violations.push(Violation {
                    kind: ViolationKind::Missing,
                    description: format!(
                        "worker {} printed {} of {} jobs; first missing: {:?}",
                        rank,
                        printed,
                        texts.len(),
                        texts[printed]
                    ),
                    related_entries: vec![],
                });
            }
        }

        CheckResult {
            passed: violations.is_empty(),
            violations,
            stats,
        }
    }

    fn check_overlap(&self, records: &[PrintRecord], violations: &mut Vec<Violation>) {
        let mut order: Vec<usize> = (0..records.len()).collect();
        order.sort_by_key(|&i| records[i].started);

        // Index of the print that finishes last among those started so far.
        let mut latest: Option<usize> = None;
        for &idx in &order {
            let next = &records[idx];
            if let Some(open) = latest {
                let a = &records[open];
                if next.started < a.finished {
                    violations.push(Violation {
                        kind: ViolationKind::Overlap,
                        description: format!(
                            "worker {} printed {:?} while worker {} was printing {:?}",
                            next.rank, next.text, a.rank, a.text
                        ),
                        related_entries: vec![open, idx],
                    });
                }
                if next.finished <= a.finished {
                    continue;
                }
            }
            latest = Some(idx);
        }
    }

    fn check_clocks(&self, records: &[PrintRecord], indices: &[usize], violations: &mut Vec<Violation>) {
        for pair in indices.windows(2) {
            let (prev, next) = (&records[pair[0]], &records[pair[1]]);
            if next.clock < prev.clock {
                violations.push(Violation {
                    kind: ViolationKind::ClockRegression,
                    description: format!(
                        "worker {} clock went from {} to {}",
                        next.rank, prev.clock, next.clock
                    ),
                    related_entries: vec![pair[0], pair[1]],
                });
            }
        }
    }

    /// Compare one worker's prints, in order, with its expected jobs.
    fn check_worker_output(
        &self,
        rank: Rank,
        records: &[PrintRecord],
        indices: &[usize],
        violations: &mut Vec<Violation>,
    ) {
        let expected = self.expected.get(&rank).map(Vec::as_slice).unwrap_or(&[]);
        let mut seen: HashMap<&str, usize> = HashMap::new();

        for (pos, &idx) in indices.iter().enumerate() {
            let text = records[idx].text.as_str();

            if let Some(&first) = seen.get(text) {
                // Repeated texts are legitimate only if the job file repeats them.
                let allowed = expected.iter().filter(|t| t.as_str() == text).count();
                let printed = indices[..=pos].iter().filter(|&&i| records[i].text == text).count();
                if printed > allowed {
                    violations.push(Violation {
                        kind: ViolationKind::Duplicate,
                        description: format!("worker {} printed {:?} {} times", rank, text, printed),
                        related_entries: vec![first, idx],
                    });
                    continue;
                }
            } else {
                seen.insert(text, idx);
            }

            match expected.get(pos) {
                Some(want) if want == text => {}
                Some(want) if expected.iter().any(|t| t == text) => violations.push(Violation {
                    kind: ViolationKind::FifoOrder,
                    description: format!(
                        "worker {} print #{} was {:?}, expected {:?}",
                        rank, pos, text, want
                    ),
                    related_entries: vec![idx],
                }),
                _ => violations.push(Violation {
                    kind: ViolationKind::Unexpected,
                    description: format!("worker {} printed unknown job {:?}", rank, text),
                    related_entries: vec![idx],
                }),
            }
        }
    }
}
