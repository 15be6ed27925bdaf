//! Where granted prints go.

use std::fmt;
use std::io::{self, Write};

use crate::fabric::Rank;

/// One line of console output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrintLine<'a> {
    /// World rank of the printing worker.
    pub rank: Rank,
    /// Logical clock at the time of the print.
    pub clock: u64,
    pub text: &'a str,
}

impl fmt::Display for PrintLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Message: '{}', rank: '{}', clock: '{}'",
            self.text, self.rank, self.clock
        )
    }
}

/// The shared output resource guarded by the console lock.
pub trait ConsoleSink: Send {
    fn print(&mut self, line: PrintLine<'_>) -> io::Result<()>;
}

/// Writes each line to standard output and flushes.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl ConsoleSink for StdoutSink {
    fn print(&mut self, line: PrintLine<'_>) -> io::Result<()> {
        let mut out = io::stdout().lock();
        writeln!(out, "{}", line)?;
        out.flush()
    }
}
