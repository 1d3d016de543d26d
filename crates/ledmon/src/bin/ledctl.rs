//! Enclosure LED control utility (ledctl)
//!
//! One-shot companion to the monitor daemon. Pattern mode pairs an IBPI
//! pattern with device paths (`ledctl locate=/dev/sda`); slot mode lists
//! and manipulates slots per controller. Configuration comes from the
//! daemon's shared-memory bridge when one is published.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ledmon::config::{LedConf, DEFAULT_CONF_PATH};
use ledmon::ibpi::IbpiPattern;
use ledmon::shm;
use ledmon::slots::{self, Slot};
use ledmon::status::Status;
use ledmon::sysfs::{CntrlType, Scanner, Snapshot};

#[derive(Debug, Parser)]
#[command(
    name = "ledctl",
    version,
    about = "Enclosure LED control utility",
    disable_version_flag = true
)]
struct Cli {
    /// Set patterns from the positional PATTERN=device list (default mode)
    #[arg(long)]
    ibpi: bool,

    /// List LED-capable controllers
    #[arg(short = 'L', long = "list-controllers")]
    list_controllers: bool,

    /// List slots of a controller type
    #[arg(short = 'P', long = "list-slots")]
    list_slots: bool,

    /// Print one slot's state
    #[arg(short = 'G', long = "get-slot")]
    get_slot: bool,

    /// Set one slot's state
    #[arg(short = 'S', long = "set-slot")]
    set_slot: bool,

    /// Controller type for the slot commands (AHCI, SCSI, NPEM, VMD, ...)
    #[arg(short = 'n', long = "controller-type")]
    controller_type: Option<String>,

    /// Select a slot by the device it holds
    #[arg(short = 'd', long = "device")]
    device: Option<String>,

    /// Select a slot by identifier
    #[arg(short = 'p', long = "slot")]
    slot: Option<String>,

    /// Pattern name for set-slot
    #[arg(short = 's', long = "state")]
    state: Option<String>,

    /// Restrict get-slot output to one field: slot, device or state
    #[arg(long = "print")]
    print: Option<String>,

    /// Leave devices missing from the pattern list alone
    #[arg(short = 'x', long = "listed-only")]
    listed_only: bool,

    /// Log file path
    #[arg(short = 'l', long = "log")]
    log: Option<PathBuf>,

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

    /// PATTERN=device[,device...] or PATTERN={ device ... } groups
    #[arg(trailing_var_arg = true)]
    patterns: Vec<String>,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
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
            eprintln!("ledctl: {status}");
            ExitCode::from(status.exit_code() as u8)
        }
    }
}

/// Effective configuration: bridge first, then the file, then defaults.
fn load_config(cli: &Cli) -> Result<LedConf, Status> {
    let mut conf = shm::load(Path::new(shm::BRIDGE_DEV_PATH))
        .or_else(|| {
            let default = Path::new(DEFAULT_CONF_PATH);
            default.is_file().then(|| LedConf::load(default).ok()).flatten()
        })
        .unwrap_or_default();
    if let Some(level) = &cli.log_level {
        conf.log_level = level.parse()?;
    }
    if let Some(path) = &cli.log {
        conf.log_path = path.clone();
    }
    Ok(conf)
}

fn run(cli: Cli) -> Result<(), Status> {
    let conf = load_config(&cli)?;
    tracing_subscriber::registry()
        .with(EnvFilter::new(conf.log_level.tracing_directive()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    if !nix::unistd::Uid::effective().is_root() {
        return Err(Status::NotPrivileged);
    }
    if cli.device.is_some() && cli.slot.is_some() {
        return Err(Status::Cmdline(
            "--device and --slot are mutually exclusive".to_string(),
        ));
    }

    let scanner = Scanner::default();
    let mut snapshot = scanner.scan(&conf);

    if cli.list_controllers {
        return list_controllers(&snapshot);
    }
    if cli.list_slots {
        let cntrl_type = controller_type(&cli)?;
        for slot in slots::list(&snapshot, cntrl_type) {
            print_slot(&slot, None);
        }
        return Ok(());
    }
    if cli.get_slot {
        let cntrl_type = controller_type(&cli)?;
        let slot = select_slot(&cli, &snapshot, cntrl_type, &scanner)?;
        print_slot(&slot, cli.print.as_deref());
        return Ok(());
    }
    if cli.set_slot {
        let cntrl_type = controller_type(&cli)?;
        let slot = select_slot(&cli, &snapshot, cntrl_type, &scanner)?;
        let state = cli
            .state
            .as_deref()
            .ok_or_else(|| Status::Cmdline("--set-slot needs --state".to_string()))?;
        let pattern: IbpiPattern = state.parse()?;
        return slots::set(&mut snapshot, &conf, &slot, pattern);
    }

    // default: pattern mode
    let groups = parse_pattern_args(&cli.patterns)?;
    let mut requests = Vec::new();
    for (pattern, devices) in groups {
        for device in devices {
            let canonical = slots::resolve_device_path(&scanner, &device)?;
            requests.push((pattern, canonical));
        }
    }
    slots::apply_patterns(&mut snapshot, &conf, &requests, cli.listed_only)
}

fn controller_type(cli: &Cli) -> Result<CntrlType, Status> {
    let name = cli
        .controller_type
        .as_deref()
        .ok_or_else(|| Status::Cmdline("--controller-type is required".to_string()))?;
    CntrlType::from_name(name)
        .ok_or_else(|| Status::InvalidController(format!("unknown controller type '{name}'")))
}

fn select_slot(
    cli: &Cli,
    snapshot: &Snapshot,
    cntrl_type: CntrlType,
    scanner: &Scanner,
) -> Result<Slot, Status> {
    if let Some(device) = &cli.device {
        return slots::get_by_device(snapshot, cntrl_type, scanner, device);
    }
    if let Some(id) = &cli.slot {
        return slots::get_by_id(snapshot, cntrl_type, id);
    }
    Err(Status::Cmdline(
        "one of --device or --slot is required".to_string(),
    ))
}

fn list_controllers(snapshot: &Snapshot) -> Result<(), Status> {
    if snapshot.controllers.is_empty() {
        return Err(Status::ListEmpty);
    }
    for controller in &snapshot.controllers {
        println!(
            "{},{}",
            controller.sysfs_path.display(),
            controller.cntrl_type.name()
        );
    }
    Ok(())
}

fn print_slot(slot: &Slot, field: Option<&str>) {
    let device = slot
        .device
        .as_ref()
        .map(|name| format!("/dev/{name}"))
        .unwrap_or_else(|| "(empty)".to_string());
    match field {
        Some("slot") => println!("{}", slot.id),
        Some("device") => println!("{device}"),
        Some("state") => println!("{}", slot.state),
        _ => println!("slot: {} led state: {} device: {}", slot.id, slot.state, device),
    }
}

/// Parse the positional pattern groups.
///
/// Two grammars are accepted: `pattern=dev1,dev2` and
/// `pattern={ dev1 dev2 }` where the shell has already split the braces
/// into separate arguments.
fn parse_pattern_args(args: &[String]) -> Result<Vec<(IbpiPattern, Vec<String>)>, Status> {
    let mut groups: Vec<(IbpiPattern, Vec<String>)> = Vec::new();
    let mut open_group = false;
    for arg in args {
        if open_group {
            if arg == "}" {
                open_group = false;
            } else {
                groups
                    .last_mut()
                    .expect("open group implies a current group")
                    .1
                    .push(arg.clone());
            }
            continue;
        }
        let (name, rest) = arg
            .split_once('=')
            .ok_or_else(|| Status::Cmdline(format!("expected PATTERN=devices, got '{arg}'")))?;
        let pattern: IbpiPattern = name.parse()?;
        if rest == "{" {
            groups.push((pattern, Vec::new()));
            open_group = true;
        } else {
            let devices: Vec<String> = rest
                .split(',')
                .filter(|d| !d.is_empty())
                .map(str::to_string)
                .collect();
            if devices.is_empty() {
                return Err(Status::Cmdline(format!("no devices for pattern '{name}'")));
            }
            groups.push((pattern, devices));
        }
    }
    if open_group {
        return Err(Status::Cmdline("unterminated '{' device group".to_string()));
    }
    Ok(groups)
}
