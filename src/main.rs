//! Addman - Main entry point.
//!
//! Updates every add-on listed in the config file and saves the new state.
//!
//! Usage: addman [OPTIONS]
//!
//! Options:
//!   -c, --config <PATH>     Config file (default: addons.json)
//!   --check                 Report available updates, change nothing
//!   --no-color              Plain output
//!   --log-level <LEVEL>     Diagnostic level (env: ADDMAN_LOG)
//!   --log-file              Also write diagnostics to ~/.addman/logs
//!   --log-dir <DIR>         Write diagnostics to DIR

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use crossterm::tty::IsTty;

use addman::addons::{AddonManager, HttpTransport};
use addman::logging::{self, DEFAULT_LOG_LEVEL, LOG_LEVEL_ENV, LogConfig};
use addman::style::Palette;

#[derive(Debug, Parser)]
#[command(name = "addman", version, about = "Keeps GitHub-hosted add-ons up to date")]
struct Cli {
    /// Config file
    #[arg(short, long, value_name = "PATH", default_value = "addons.json")]
    config: PathBuf,

    /// Report available updates without downloading or saving anything
    #[arg(long)]
    check: bool,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Diagnostic log level or filter directive
    #[arg(long, value_name = "LEVEL", env = LOG_LEVEL_ENV, default_value = DEFAULT_LOG_LEVEL)]
    log_level: String,

    /// Also write diagnostics to the default log directory
    #[arg(long)]
    log_file: bool,

    /// Write diagnostics to this directory
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,
}

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let log_dir = cli
        .log_dir
        .clone()
        .or_else(|| cli.log_file.then(logging::log_directory));
    let _log_guard = logging::init(&LogConfig {
        level: cli.log_level.clone(),
        log_dir,
        ..LogConfig::default()
    })?;

    let palette = Palette::new(!cli.no_color && io::stdout().is_tty());

    let mut manager = AddonManager::load(cli.config.clone(), palette)?.check_only(cli.check);
    let settings = manager.settings();

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let report = manager.run(Arc::new(HttpTransport::new()), settings, &mut out)?;
    out.flush()?;

    if report.failed() > 0 {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
