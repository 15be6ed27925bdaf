//! Job file parsing.
//!
//! The first line holds the number of workers `N`. Every further line is
//! `<rank> <text>`: the world rank of the destination worker, one space, and
//! the job text, which is delivered verbatim. Blank lines are skipped.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::fabric::Rank;

/// Why a job file was rejected.
#[derive(Debug, Error)]
pub enum JobFileError {
    #[error("Cannot read file {}!", .path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("job file is empty; expected the worker count on the first line")]
    MissingHeader,

    #[error("invalid worker count {value:?}; expected a positive integer")]
    InvalidWorkerCount { value: String },

    #[error("line {line}: {reason}")]
    InvalidLine { line: usize, reason: String },

    #[error("line {line}: rank {rank} is not a worker (workers are 1..={workers})")]
    RankOutOfRange { line: usize, rank: Rank, workers: u32 },
}

/// One job addressed to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLine {
    /// World rank of the destination worker.
    pub rank: Rank,
    pub text: String,
}

/// A parsed job file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFile {
    /// Number of workers the file was written for.
    pub workers: u32,
    /// Jobs in file order.
    pub jobs: Vec<JobLine>,
}

impl JobFile {
    /// Read and parse the file at `path`.
    pub fn load(path: &Path) -> Result<Self, JobFileError> {
        Self::parse(&read(path)?)
    }

    /// Read only the worker count.
    pub fn peek_workers(path: &Path) -> Result<u32, JobFileError> {
        parse_header(&read(path)?).map(|(workers, _)| workers)
    }

    /// Parse and validate a whole job file.
    pub fn parse(contents: &str) -> Result<Self, JobFileError> {
        let (workers, rest) = parse_header(contents)?;

        let mut jobs = Vec::new();
        for (idx, raw) in rest.enumerate() {
            // Line 1 is the header.
            let line = idx + 2;
            let raw = raw.strip_suffix('\r').unwrap_or(raw);
            if raw.trim().is_empty() {
                continue;
            }

            let (rank, text) = raw.split_once(' ').ok_or_else(|| JobFileError::InvalidLine {
                line,
                reason: "expected `<rank> <text>`".to_string(),
            })?;
            let rank: Rank = rank.trim().parse().map_err(|_| JobFileError::InvalidLine {
                line,
                reason: format!("invalid rank {:?}", rank),
            })?;
            if rank == 0 || rank > workers {
                return Err(JobFileError::RankOutOfRange { line, rank, workers });
            }

            jobs.push(JobLine {
                rank,
                text: text.to_string(),
            });
        }

        Ok(JobFile { workers, jobs })
    }

    /// Coordinator plus one process per worker.
    pub fn processes_needed(&self) -> u32 {
        self.workers + 1
    }

    /// Texts addressed to one worker, in file order.
    pub fn jobs_for(&self, rank: Rank) -> impl Iterator<Item = &str> + '_ {
        self.jobs
            .iter()
            .filter(move |j| j.rank == rank)
            .map(|j| j.text.as_str())
    }
}

fn read(path: &Path) -> Result<String, JobFileError> {
    fs::read_to_string(path).map_err(|source| JobFileError::Unreadable {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_header(contents: &str) -> Result<(u32, std::str::Lines<'_>), JobFileError> {
    let mut lines = contents.lines();
    let header = lines.next().ok_or(JobFileError::MissingHeader)?.trim();
    if header.is_empty() {
        return Err(JobFileError::MissingHeader);
    }

    match header.parse::<u32>() {
        Ok(workers) if workers > 0 => Ok((workers, lines)),
        _ => Err(JobFileError::InvalidWorkerCount {
            value: header.to_string(),
        }),
    }
}
