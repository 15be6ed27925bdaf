//! Command line and logging setup.

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser, ValueEnum};

use crate::cluster::RunConfig;
use crate::coordinator::JobFile;
use crate::fabric::FabricConfig;
use crate::lock::ReplyPolicy;

/// Command line of the `conlock` binary.
#[derive(Debug, Parser)]
#[command(
    name = "conlock",
    version,
    about = "Print a job file through a group of workers sharing one console"
)]
pub struct Cli {
    /// Job file: worker count on the first line, then `<rank> <text>` lines
    pub job_file: PathBuf,

    /// Total process count, coordinator included [default: workers + 1]
    #[arg(short = 'n', long)]
    pub processes: Option<u32>,

    /// How peers' requests are prioritised against our own
    #[arg(long, value_enum, default_value_t = PolicyArg::RequestOrder)]
    pub policy: PolicyArg,

    /// Bound every inbox to this many messages
    #[arg(long, value_name = "N")]
    pub inbox_capacity: Option<usize>,

    /// Random delivery delay per message, in microseconds
    #[arg(long, value_name = "MIN..MAX", value_parser = parse_jitter)]
    pub jitter_us: Option<(Duration, Duration)>,

    /// Log more (-v info, -vv debug, -vvv trace); RUST_LOG overrides
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

/// `--policy` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PolicyArg {
    /// Defer requests that come after our own, ties broken by rank.
    RequestOrder,
    /// Compare against the local clock only.
    LocalClock,
}

impl From<PolicyArg> for ReplyPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::RequestOrder => ReplyPolicy::RequestOrder,
            PolicyArg::LocalClock => ReplyPolicy::LocalClock,
        }
    }
}

impl Cli {
    /// Resolve the run settings.
    ///
    /// Without `--processes` the group is sized from the job file header. An
    /// unreadable or malformed file yields a one-process group, leaving the
    /// coordinator to report the problem.
    pub fn into_run_config(self) -> RunConfig {
        let processes = self.processes.unwrap_or_else(|| {
            JobFile::peek_workers(&self.job_file)
                .map(|workers| workers.saturating_add(1))
                .unwrap_or(1)
        });

        RunConfig {
            job_file: self.job_file,
            processes,
            policy: self.policy.into(),
            fabric: FabricConfig {
                inbox_capacity: self.inbox_capacity,
                jitter: self.jitter_us,
            },
        }
    }
}

fn parse_jitter(value: &str) -> Result<(Duration, Duration), String> {
    let (min, max) = value
        .split_once("..")
        .ok_or_else(|| format!("expected MIN..MAX, got {:?}", value))?;
    let min: u64 = min.trim().parse().map_err(|e| format!("invalid minimum: {}", e))?;
    let max: u64 = max.trim().parse().map_err(|e| format!("invalid maximum: {}", e))?;
    if min > max {
        return Err(format!("minimum {} exceeds maximum {}", min, max));
    }
    Ok((Duration::from_micros(min), Duration::from_micros(max)))
}

/// Install the global subscriber. Logs go to stderr; stdout is the console.
pub fn init_logging(verbose: u8) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // Ignore a subscriber that is already installed.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_thread_names(true))
        .try_init();
}
