//! tesh entrypoint: the headless host driver.
//!
//! The graphical window is a separate component; this binary drives the core
//! the same way the window would: it executes one command line, runs the
//! single-threaded cooperative scheduler at the frame rate, and streams
//! newly arrived backlog bytes to stdout. The process exit code is the
//! backlog's exit code.

use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use core_shell::{Shell, SharedBacklog, new_backlog};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Target frame interval for the scheduler loop (~60 Hz).
const FRAME_INTERVAL: Duration = Duration::from_millis(1000 / 60);

#[derive(Parser, Debug)]
#[command(name = "tesh", about = "Terminal shell core driver")]
struct Args {
    /// Command line to execute.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,

    /// Configuration file override (defaults to the discovered tesh.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log filter directive, e.g. `debug` or `shell.exec=trace`.
    #[arg(long, default_value = "info")]
    log_filter: String,

    /// Logical terminal width in columns.
    #[arg(long, default_value_t = 100)]
    width: u16,

    /// Logical terminal height in rows.
    #[arg(long, default_value_t = 40)]
    height: u16,
}

fn init_tracing(filter: &str) -> Option<WorkerGuard> {
    let appender = tracing_appender::rolling::never(".", "tesh.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let result = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init();
    match result {
        Ok(()) => Some(guard),
        Err(_) => None,
    }
}

/// Write backlog bytes past `printed` to stdout; returns the new watermark.
fn flush_new_output(backlog: &SharedBacklog, printed: u64) -> Result<u64> {
    let backlog = backlog.borrow();
    let length = backlog.length;
    if printed >= length {
        return Ok(printed);
    }
    let mut stdout = std::io::stdout().lock();
    let mut chunk = Vec::with_capacity((length - printed) as usize);
    for index in printed..length {
        chunk.push(backlog.get(index));
    }
    stdout.write_all(&chunk)?;
    stdout.flush()?;
    Ok(length)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _guard = init_tracing(&args.log_filter);

    let config = core_config::load_from(args.config.clone())?;
    let mut shell = Shell::new(args.width, args.height);
    shell.import_environment();

    let backlog = new_backlog(0, &config);
    let line = args.command.join(" ");
    info!(target: "tesh", command = %line, "executing");
    shell.run_script(&config, &backlog, &line);

    let mut printed = 0u64;
    while !shell.scripts.is_empty() {
        let frame_start = Instant::now();
        shell.tick_scripts(&config);
        printed = flush_new_output(&backlog, printed)?;

        let elapsed = frame_start.elapsed();
        if elapsed < FRAME_INTERVAL {
            std::thread::sleep(FRAME_INTERVAL - elapsed);
        }
    }
    flush_new_output(&backlog, printed)?;

    let exit_code = backlog.borrow().exit_code;
    info!(target: "tesh", exit_code, "done");
    std::process::exit(exit_code);
}
