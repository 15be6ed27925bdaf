use std::process;

use anyhow::{Context, Result};
use clap::Parser;

use console_lock::cluster;
use console_lock::config::{init_logging, Cli};
use console_lock::worker::StdoutSink;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = cli.into_run_config();
    let report = cluster::run(&config, |_| StdoutSink).context("process group failed")?;

    process::exit(report.exit_status());
}
