//! Enclosure LED monitor daemon (ledmon)
//!
//! Watches block devices participating in software RAID arrays and keeps
//! their enclosure LEDs in sync. Runs as a singleton daemon; scan cadence
//! and filters come from the configuration file, overridable on the
//! command line.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ledmon::config::{LedConf, LogLevel, DEFAULT_CONF_PATH, MIN_INTERVAL};
use ledmon::events;
use ledmon::monitor::Monitor;
use ledmon::pidfile::PidFile;
use ledmon::shm;
use ledmon::status::Status;
use ledmon::sysfs::Scanner;

const PID_PATH: &str = "/var/run/ledmon.pid";

#[derive(Debug, Parser)]
#[command(
    name = "ledmon",
    version,
    about = "Enclosure LED monitor service",
    disable_version_flag = true
)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Log file path
    #[arg(short = 'l', long = "log")]
    log: Option<PathBuf>,

    /// Scan interval in seconds
    #[arg(short = 't', long = "interval")]
    interval: Option<u64>,

    /// Stay in the foreground, logging to stderr as well
    #[arg(long)]
    foreground: bool,

    /// Verbosity: QUIET, ERROR, WARNING, INFO, DEBUG, ALL or 0..5
    #[arg(long = "log-level")]
    log_level: Option<String>,

    /// Print version information
    #[arg(
        short = 'v',
        long = "version",
        action = clap::ArgAction::Version,
        value_parser = clap::value_parser!(bool)
    )]
    version: Option<bool>,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // help and version exit cleanly; real parse errors are
            // command-line errors
            if err.use_stderr() {
                let _ = err.print();
                return ExitCode::from(Status::Cmdline(String::new()).exit_code() as u8);
            }
            let _ = err.print();
            return ExitCode::SUCCESS;
        }
    };
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(status) => {
            eprintln!("ledmon: {status}");
            ExitCode::from(status.exit_code() as u8)
        }
    }
}

fn load_config(cli: &Cli) -> Result<LedConf, Status> {
    let mut conf = match &cli.config {
        // an explicitly requested file must exist
        Some(path) => LedConf::load(path)
            .map_err(|err| Status::ConfigFile(format!("{}: {err}", path.display())))?,
        None => {
            let default = Path::new(DEFAULT_CONF_PATH);
            if default.is_file() {
                LedConf::load(default)?
            } else {
                LedConf::default()
            }
        }
    };
    if let Some(path) = &cli.log {
        conf.log_path = path.clone();
    }
    if let Some(interval) = cli.interval {
        conf.interval = interval.max(MIN_INTERVAL);
    }
    if let Some(level) = &cli.log_level {
        conf.log_level = level.parse()?;
    }
    Ok(conf)
}

fn init_logging(conf: &LedConf, foreground: bool) -> Result<(), Status> {
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&conf.log_path)
        .map_err(|err| Status::LogFile(format!("{}: {err}", conf.log_path.display())))?;
    let stderr_layer = if foreground && conf.log_level != LogLevel::Quiet {
        Some(fmt::layer().with_writer(std::io::stderr))
    } else {
        None
    };
    tracing_subscriber::registry()
        .with(EnvFilter::new(conf.log_level.tracing_directive()))
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(log_file)),
        )
        .with(stderr_layer)
        .init();
    Ok(())
}

fn ignore_signals() {
    use nix::sys::signal::{signal, SigHandler, Signal};
    for sig in [
        Signal::SIGHUP,
        Signal::SIGALRM,
        Signal::SIGPIPE,
        Signal::SIGUSR1,
    ] {
        unsafe {
            let _ = signal(sig, SigHandler::SigIgn);
        }
    }
}

fn run(cli: Cli) -> Result<(), Status> {
    let conf = load_config(&cli)?;
    init_logging(&conf, cli.foreground)?;

    if !nix::unistd::Uid::effective().is_root() {
        return Err(Status::NotPrivileged);
    }
    if !cli.foreground {
        nix::unistd::daemon(false, false).map_err(|errno| Status::DataError(format!(
            "cannot daemonize: {errno}"
        )))?;
    }
    let pidfile = PidFile::acquire(Path::new(PID_PATH))?;
    ignore_signals();

    // publish the effective configuration for ledctl
    shm::publish(shm::BRIDGE_NAME, &conf)?;

    let mut monitor = Monitor::new(conf, Scanner::default());
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| Status::DataError(format!("cannot start runtime: {err}")))?;
    let result = runtime.block_on(events::run(&mut monitor, Path::new("/sys")));

    shm::unpublish(shm::BRIDGE_NAME);
    pidfile.remove();
    result
}
