//! Runtime configuration
//!
//! Both binaries share [`LedConf`]. The daemon loads it from the
//! configuration file (default `/etc/ledmon.conf`), overlays command-line
//! flags and publishes the effective result to the shared-memory bridge;
//! `ledctl` prefers the bridge, then its own file, then built-in defaults.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::warn;

use crate::status::Status;

/// Default scan interval in seconds.
pub const DEFAULT_INTERVAL: u64 = 10;
/// Lower bound on the scan interval; smaller values are clamped.
pub const MIN_INTERVAL: u64 = 5;
/// Default log destination of the daemon.
pub const DEFAULT_LOG_PATH: &str = "/var/log/ledmon.log";
/// Default configuration file location.
pub const DEFAULT_CONF_PATH: &str = "/etc/ledmon.conf";

/// Verbosity levels, ordered quiet-first to match the numeric CLI form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Quiet,
    Error,
    Warning,
    Info,
    Debug,
    All,
}

impl LogLevel {
    /// Name written back into the configuration bridge.
    pub fn name(self) -> &'static str {
        match self {
            LogLevel::Quiet => "QUIET",
            LogLevel::Error => "ERROR",
            LogLevel::Warning => "WARNING",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::All => "ALL",
        }
    }

    /// Directive accepted by the tracing `EnvFilter`.
    pub fn tracing_directive(self) -> &'static str {
        match self {
            // quiet still reports fatal errors; the stderr sink is dropped
            // separately by the daemon front end
            LogLevel::Quiet => "error",
            LogLevel::Error => "error",
            LogLevel::Warning => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::All => "trace",
        }
    }
}

impl FromStr for LogLevel {
    type Err = Status;

    fn from_str(s: &str) -> Result<Self, Status> {
        match s.to_ascii_uppercase().as_str() {
            "QUIET" | "0" => Ok(LogLevel::Quiet),
            "ERROR" | "1" => Ok(LogLevel::Error),
            "WARNING" | "2" => Ok(LogLevel::Warning),
            "INFO" | "3" => Ok(LogLevel::Info),
            "DEBUG" | "4" => Ok(LogLevel::Debug),
            "ALL" | "5" => Ok(LogLevel::All),
            other => Err(Status::ConfigFile(format!("unknown log level '{other}'"))),
        }
    }
}

/// Which 32-bit value the AHCI encoder writes for `locate_off`.
///
/// Legacy controllers treated the locate value itself as the off command;
/// modern firmware expects zero. Selectable because deployed backplanes
/// disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AhciLocateOffValue {
    #[default]
    Zero,
    Locate,
}

impl FromStr for AhciLocateOffValue {
    type Err = Status;

    fn from_str(s: &str) -> Result<Self, Status> {
        match s.to_ascii_lowercase().as_str() {
            "zero" => Ok(AhciLocateOffValue::Zero),
            "locate" => Ok(AhciLocateOffValue::Locate),
            other => Err(Status::ConfigFile(format!(
                "AHCI_LOCATE_OFF_VALUE must be 'zero' or 'locate', got '{other}'"
            ))),
        }
    }
}

/// Effective runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedConf {
    pub interval: u64,
    pub log_level: LogLevel,
    pub log_path: PathBuf,
    pub blink_on_migration: bool,
    pub blink_on_init: bool,
    pub rebuild_blink_on_all: bool,
    pub raid_members_only: bool,
    pub allowlist: Vec<String>,
    pub excludelist: Vec<String>,
    pub ahci_locate_off_value: AhciLocateOffValue,
}

impl Default for LedConf {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            log_level: LogLevel::Warning,
            log_path: PathBuf::from(DEFAULT_LOG_PATH),
            blink_on_migration: true,
            blink_on_init: true,
            rebuild_blink_on_all: false,
            raid_members_only: false,
            allowlist: Vec::new(),
            excludelist: Vec::new(),
            ahci_locate_off_value: AhciLocateOffValue::default(),
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, Status> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "yes" | "true" | "enabled" => Ok(true),
        "0" | "no" | "false" | "disabled" => Ok(false),
        other => Err(Status::ConfigFile(format!(
            "{key} expects a boolean, got '{other}'"
        ))),
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl LedConf {
    /// Parse `KEY=VALUE` configuration text.
    ///
    /// `#` starts a comment, blank lines are permitted, unknown keys are a
    /// configuration error. The same grammar covers the on-disk file and
    /// the shared-memory bridge.
    pub fn parse(text: &str) -> Result<Self, Status> {
        let mut conf = LedConf::default();
        for (lineno, raw) in text.lines().enumerate() {
            let line = match raw.split_once('#') {
                Some((before, _)) => before.trim(),
                None => raw.trim(),
            };
            if line.is_empty() {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                Status::ConfigFile(format!("line {}: expected KEY=VALUE", lineno + 1))
            })?;
            conf.apply(key.trim(), value.trim())?;
        }
        conf.reconcile_lists();
        Ok(conf)
    }

    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self, Status> {
        let text = std::fs::read_to_string(path).map_err(|source| Status::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<(), Status> {
        match key.to_ascii_uppercase().as_str() {
            "INTERVAL" => {
                let secs: u64 = value.parse().map_err(|_| {
                    Status::ConfigFile(format!("INTERVAL expects seconds, got '{value}'"))
                })?;
                if secs < MIN_INTERVAL {
                    warn!("INTERVAL {} below minimum, clamping to {}", secs, MIN_INTERVAL);
                    self.interval = MIN_INTERVAL;
                } else {
                    self.interval = secs;
                }
            }
            "LOG_LEVEL" => self.log_level = value.parse()?,
            "LOG_PATH" => self.log_path = PathBuf::from(value),
            "BLINK_ON_MIGR" => self.blink_on_migration = parse_bool(key, value)?,
            "BLINK_ON_INIT" => self.blink_on_init = parse_bool(key, value)?,
            "REBUILD_BLINK_ON_ALL" => self.rebuild_blink_on_all = parse_bool(key, value)?,
            "RAID_MEMBERS_ONLY" => self.raid_members_only = parse_bool(key, value)?,
            "ALLOWLIST" => self.allowlist = parse_list(value),
            "EXCLUDELIST" => self.excludelist = parse_list(value),
            "WHITELIST" => {
                warn!("WHITELIST is deprecated, use ALLOWLIST");
                self.allowlist = parse_list(value);
            }
            "BLACKLIST" => {
                warn!("BLACKLIST is deprecated, use EXCLUDELIST");
                self.excludelist = parse_list(value);
            }
            "AHCI_LOCATE_OFF_VALUE" => self.ahci_locate_off_value = value.parse()?,
            other => {
                return Err(Status::ConfigFile(format!("unknown key '{other}'")));
            }
        }
        Ok(())
    }

    /// The lists are mutually exclusive; allow wins.
    fn reconcile_lists(&mut self) {
        if !self.allowlist.is_empty() && !self.excludelist.is_empty() {
            warn!("both ALLOWLIST and EXCLUDELIST set, ignoring EXCLUDELIST");
            self.excludelist.clear();
        }
    }

    /// Serialize to the `KEY=VALUE` form published on the bridge.
    pub fn to_bridge_text(&self) -> String {
        let bool_text = |b: bool| if b { "true" } else { "false" };
        format!(
            "BLINK_ON_INIT={}\nBLINK_ON_MIGR={}\nLOG_LEVEL={}\nLOG_PATH={}\n\
             RAID_MEMBERS_ONLY={}\nREBUILD_BLINK_ON_ALL={}\nINTERVAL={}\n\
             ALLOWLIST={}\nEXCLUDELIST={}\nAHCI_LOCATE_OFF_VALUE={}\n",
            bool_text(self.blink_on_init),
            bool_text(self.blink_on_migration),
            self.log_level.name(),
            self.log_path.display(),
            bool_text(self.raid_members_only),
            bool_text(self.rebuild_blink_on_all),
            self.interval,
            self.allowlist.join(","),
            self.excludelist.join(","),
            match self.ahci_locate_off_value {
                AhciLocateOffValue::Zero => "zero",
                AhciLocateOffValue::Locate => "locate",
            },
        )
    }
}
