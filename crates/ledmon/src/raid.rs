//! Software RAID model
//!
//! Built from md's sysfs surface every scan: one [`RaidDevice`] per array,
//! one [`Slave`] edge per member. The model's single product is a suggested
//! IBPI pattern per member, computed by [`suggest_pattern`].

use std::path::{Path, PathBuf};

use bitflags::bitflags;
use tracing::warn;

use crate::config::LedConf;
use crate::ibpi::IbpiPattern;
use crate::utils;

/// Overall array state, `md/array_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaidState {
    Unknown,
    Clear,
    Inactive,
    Suspended,
    Readonly,
    ReadAuto,
    Clean,
    Active,
    WritePending,
    ActiveIdle,
}

impl RaidState {
    fn from_sysfs(text: &str) -> Self {
        match text {
            "clear" => RaidState::Clear,
            "inactive" => RaidState::Inactive,
            "suspended" => RaidState::Suspended,
            "readonly" => RaidState::Readonly,
            "read-auto" => RaidState::ReadAuto,
            "clean" => RaidState::Clean,
            "active" => RaidState::Active,
            "write-pending" => RaidState::WritePending,
            "active-idle" => RaidState::ActiveIdle,
            _ => RaidState::Unknown,
        }
    }
}

/// Array activity, `md/sync_action`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Idle,
    Reshape,
    Frozen,
    Resync,
    Recover,
    Check,
    Repair,
}

impl SyncAction {
    fn from_sysfs(text: &str) -> Self {
        match text {
            "reshape" => SyncAction::Reshape,
            "frozen" => SyncAction::Frozen,
            "resync" => SyncAction::Resync,
            "recover" => SyncAction::Recover,
            "check" => SyncAction::Check,
            "repair" => SyncAction::Repair,
            _ => SyncAction::Idle,
        }
    }
}

/// RAID level, `md/level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaidLevel {
    Linear,
    Raid0,
    Raid1,
    Raid4,
    Raid5,
    Raid6,
    Raid10,
    Faulty,
    Container,
    Unknown,
}

impl RaidLevel {
    fn from_sysfs(text: &str) -> Self {
        match text {
            "linear" => RaidLevel::Linear,
            "raid0" => RaidLevel::Raid0,
            "raid1" => RaidLevel::Raid1,
            "raid4" => RaidLevel::Raid4,
            "raid5" => RaidLevel::Raid5,
            "raid6" => RaidLevel::Raid6,
            "raid10" => RaidLevel::Raid10,
            "faulty" => RaidLevel::Faulty,
            "container" => RaidLevel::Container,
            _ => RaidLevel::Unknown,
        }
    }
}

/// Whether the md device is a data volume or a metadata container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaidType {
    Volume,
    Container,
}

bitflags! {
    /// Member state flags, `md/dev-*/state` (comma-separated list).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SlaveState: u8 {
        const FAULTY       = 1 << 0;
        const IN_SYNC      = 1 << 1;
        const WRITE_MOSTLY = 1 << 2;
        const BLOCKED      = 1 << 3;
        const SPARE        = 1 << 4;
    }
}

impl SlaveState {
    fn from_sysfs(text: &str) -> Self {
        let mut state = SlaveState::empty();
        for flag in text.split(',').map(str::trim) {
            match flag {
                "faulty" => state |= SlaveState::FAULTY,
                "in_sync" => state |= SlaveState::IN_SYNC,
                "write_mostly" => state |= SlaveState::WRITE_MOSTLY,
                "blocked" => state |= SlaveState::BLOCKED,
                "spare" => state |= SlaveState::SPARE,
                _ => {}
            }
        }
        state
    }
}

/// One member edge between a block device and its array.
#[derive(Debug, Clone)]
pub struct Slave {
    /// Short kernel name of the member, e.g. `sda`.
    pub name: String,
    /// Canonical sysfs path of the member block device.
    pub block_path: PathBuf,
    pub state: SlaveState,
    /// Member slot, negative when the device holds no slot.
    pub slot: i64,
    /// Cumulative error count reported by md.
    pub errors: u64,
}

/// One md array.
#[derive(Debug, Clone)]
pub struct RaidDevice {
    /// Canonical sysfs path of the md device.
    pub sysfs_path: PathBuf,
    pub raid_type: RaidType,
    pub level: RaidLevel,
    pub state: RaidState,
    pub sync_action: SyncAction,
    pub raid_disks: u64,
    pub degraded: u64,
    pub slaves: Vec<Slave>,
}

impl RaidDevice {
    /// Read one array from its `/sys/block/mdN` directory.
    ///
    /// Returns `None` when the directory has no `md/` subtree (not an
    /// array) or when mandatory attributes are unreadable.
    pub fn from_sysfs(block_dir: &Path) -> Option<Self> {
        let md = block_dir.join("md");
        if !md.is_dir() {
            return None;
        }
        let sysfs_path = utils::canonicalize(block_dir).unwrap_or_else(|| block_dir.to_path_buf());
        let state = match utils::read_text(&md.join("array_state")) {
            Some(text) => RaidState::from_sysfs(&text),
            None => {
                warn!("array {} has no readable array_state, skipping", sysfs_path.display());
                return None;
            }
        };
        let level = utils::read_text(&md.join("level"))
            .map(|t| RaidLevel::from_sysfs(&t))
            .unwrap_or(RaidLevel::Unknown);
        let metadata = utils::read_text(&md.join("metadata_version")).unwrap_or_default();
        // external metadata without a parent reference is a container
        let raid_type = if level == RaidLevel::Container
            || (metadata.starts_with("external:") && !metadata.starts_with("external:/"))
        {
            RaidType::Container
        } else {
            RaidType::Volume
        };
        let sync_action = utils::read_text(&md.join("sync_action"))
            .map(|t| SyncAction::from_sysfs(&t))
            .unwrap_or(SyncAction::Idle);
        let raid_disks = utils::read_u64(&md.join("raid_disks")).unwrap_or(0);
        let degraded = utils::read_u64(&md.join("degraded")).unwrap_or(0);

        let mut slaves = Vec::new();
        for entry in utils::list_dir(&md) {
            let name = utils::basename(&entry);
            let Some(member) = name.strip_prefix("dev-") else {
                continue;
            };
            slaves.push(Slave::from_sysfs(block_dir, &entry, member));
        }

        Some(RaidDevice {
            sysfs_path,
            raid_type,
            level,
            state,
            sync_action,
            raid_disks,
            degraded,
            slaves,
        })
    }
}

impl Slave {
    fn from_sysfs(block_dir: &Path, dev_dir: &Path, member: &str) -> Self {
        let state = utils::read_text(&dev_dir.join("state"))
            .map(|t| SlaveState::from_sysfs(&t))
            .unwrap_or(SlaveState::empty());
        // md writes "none" while the device holds no slot
        let slot = utils::read_i64(&dev_dir.join("slot")).unwrap_or(-1);
        let errors = utils::read_u64(&dev_dir.join("errors")).unwrap_or(0);
        // the member's identity is the canonical path of its block node,
        // reachable through the slaves/ symlink next to md/
        let slave_link = block_dir.join("slaves").join(member);
        let block_path = utils::canonicalize(&slave_link).unwrap_or(slave_link);
        Slave {
            name: member.to_string(),
            block_path,
            state,
            slot,
            errors,
        }
    }
}

/// Scan all md arrays under `<sysfs_root>/block`.
pub fn scan_raids(sysfs_root: &Path) -> Vec<RaidDevice> {
    let mut raids = Vec::new();
    for entry in utils::list_dir(&sysfs_root.join("block")) {
        if !utils::basename(&entry).starts_with("md") {
            continue;
        }
        if let Some(raid) = RaidDevice::from_sysfs(&entry) {
            raids.push(raid);
        }
    }
    raids
}

/// Suggested IBPI pattern for one member, first matching rule wins.
pub fn suggest_pattern(raid: &RaidDevice, slave: &Slave, conf: &LedConf) -> IbpiPattern {
    if slave.state.contains(SlaveState::FAULTY) {
        return IbpiPattern::Failure;
    }
    if raid.degraded > 0
        && !slave.state.contains(SlaveState::IN_SYNC)
        && !slave.state.contains(SlaveState::SPARE)
    {
        return IbpiPattern::FailedArray;
    }
    if raid.sync_action == SyncAction::Recover && (conf.rebuild_blink_on_all || slave.slot >= 0) {
        return IbpiPattern::Rebuild;
    }
    if raid.sync_action == SyncAction::Reshape && conf.blink_on_migration {
        return IbpiPattern::Rebuild;
    }
    if matches!(raid.state, RaidState::Clear | RaidState::Inactive)
        && slave.state.contains(SlaveState::IN_SYNC)
    {
        return IbpiPattern::Hotspare;
    }
    if slave.state.contains(SlaveState::SPARE) {
        return IbpiPattern::Hotspare;
    }
    if raid.sync_action == SyncAction::Resync && conf.blink_on_init {
        return IbpiPattern::Rebuild;
    }
    IbpiPattern::Normal
}
