//! Sysfs inventory
//!
//! Produces, per scan, a consistent snapshot of controllers, enclosures,
//! hot-plug PCIe slots, RAID arrays and LED-capable block devices. All
//! reads are best-effort: an unreadable device is logged and skipped, a
//! malformed enclosure fails only itself.

pub mod block;
pub mod cntrl;
pub mod enclosure;
pub mod pci_slot;

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::LedConf;
use crate::raid::{self, RaidDevice, RaidType};
use crate::utils;

pub use block::BlockDevice;
pub use cntrl::{AmdPlatform, CntrlType, Controller};
pub use enclosure::Enclosure;
pub use pci_slot::PciSlot;

/// Kernel block names that never carry backplane LEDs.
const EXCLUDED_NAME_PREFIXES: &[&str] = &[
    "md", "dm-", "loop", "ram", "zram", "sr", "fd", "nbd", "pktcdvd", "mtd",
];

/// Everything one scan learned from the kernel.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub controllers: Vec<Controller>,
    pub enclosures: Vec<Enclosure>,
    pub pci_slots: Vec<PciSlot>,
    pub raids: Vec<RaidDevice>,
    pub block_devices: Vec<BlockDevice>,
    pub amd_platform: AmdPlatform,
}

impl Snapshot {
    /// Block device with the given canonical path.
    pub fn find_block(&self, canonical: &Path) -> Option<&BlockDevice> {
        self.block_devices
            .iter()
            .find(|dev| dev.sysfs_path == canonical)
    }

    /// Controller whose sink path matches, if the scan saw one.
    pub fn find_controller(&self, cntrl_path: &Path) -> Option<&Controller> {
        self.controllers
            .iter()
            .find(|c| c.sysfs_path == cntrl_path)
    }
}

/// Result of controller-type detection for one device.
struct Detection {
    cntrl_type: CntrlType,
    cntrl_path: PathBuf,
    enclosure_index: Option<usize>,
    ses_slot: Option<usize>,
}

/// Inventory scanner rooted at a sysfs tree.
///
/// The roots are parameters so the whole inventory runs against a
/// fabricated tree in tests.
#[derive(Debug, Clone)]
pub struct Scanner {
    pub sysfs_root: PathBuf,
    pub dev_root: PathBuf,
}

impl Default for Scanner {
    fn default() -> Self {
        Scanner {
            sysfs_root: PathBuf::from("/sys"),
            dev_root: PathBuf::from("/dev"),
        }
    }
}

impl Scanner {
    pub fn with_roots(sysfs_root: PathBuf, dev_root: PathBuf) -> Self {
        Scanner {
            sysfs_root,
            dev_root,
        }
    }

    /// Run one full inventory pass.
    pub fn scan(&self, conf: &LedConf) -> Snapshot {
        let amd_platform = AmdPlatform::detect(&self.sysfs_root);
        let pci_slots = pci_slot::scan_pci_slots(&self.sysfs_root);
        let enclosures = self.scan_enclosures();
        let raids = raid::scan_raids(&self.sysfs_root);

        let mut devices = Vec::new();
        for entry in utils::list_dir(&self.sysfs_root.join("block")) {
            let name = utils::basename(&entry);
            if EXCLUDED_NAME_PREFIXES.iter().any(|p| name.starts_with(p)) {
                continue;
            }
            let Some(canonical) = utils::canonicalize(&entry) else {
                continue;
            };
            let Some(detection) = self.detect(&canonical, &pci_slots, &enclosures, amd_platform)
            else {
                debug!("'{}' has no LED-capable controller, ignored", name);
                continue;
            };
            let mut device = BlockDevice::new(
                name,
                canonical.clone(),
                detection.cntrl_type,
                detection.cntrl_path,
            );
            device.host_id = cntrl::host_index(&canonical);
            device.enclosure_index = detection.enclosure_index;
            device.ses_slot = detection.ses_slot;
            devices.push(device);
        }

        // RAID membership: fold each array's suggestion into its members.
        // Volumes run first so a container's weaker suggestion never hides
        // a volume's.
        for pass in [RaidType::Volume, RaidType::Container] {
            for array in raids.iter().filter(|r| r.raid_type == pass) {
                for slave in &array.slaves {
                    let Some(device) = devices
                        .iter_mut()
                        .find(|d| d.sysfs_path == slave.block_path)
                    else {
                        continue;
                    };
                    device.suggest(raid::suggest_pattern(array, slave, conf));
                    if device.raid_path.is_none() || pass == RaidType::Volume {
                        device.raid_path = Some(array.sysfs_path.clone());
                    }
                }
            }
        }

        devices.retain(|device| retained(device, conf));

        // Controller binding: one controller object per distinct sink.
        let mut controllers: Vec<Controller> = Vec::new();
        for device in &mut devices {
            let index = controllers
                .iter()
                .position(|c| c.sysfs_path == device.cntrl_path)
                .unwrap_or_else(|| {
                    controllers.push(Controller {
                        cntrl_type: device.cntrl_type,
                        sysfs_path: device.cntrl_path.clone(),
                    });
                    controllers.len() - 1
                });
            device.cntrl_index = Some(index);
        }

        Snapshot {
            controllers,
            enclosures,
            pci_slots,
            raids,
            block_devices: devices,
            amd_platform,
        }
    }

    fn scan_enclosures(&self) -> Vec<Enclosure> {
        utils::list_dir(&self.sysfs_root.join("class/enclosure"))
            .iter()
            .filter_map(|dir| Enclosure::scan(dir, &self.dev_root))
            .collect()
    }

    fn module_loaded(&self, name: &str) -> bool {
        self.sysfs_root.join("module").join(name).is_dir()
    }

    fn ahci_em_enabled(&self) -> bool {
        utils::read_text(
            &self
                .sysfs_root
                .join("module/libahci/parameters/ahci_em_messages"),
        )
        .as_deref()
            == Some("1")
    }

    /// Apply the detection rules in order; first match wins.
    fn detect(
        &self,
        canonical: &Path,
        pci_slots: &[PciSlot],
        enclosures: &[Enclosure],
        amd_platform: AmdPlatform,
    ) -> Option<Detection> {
        // 1. VMD domain with a pciehp-driven slot
        if cntrl::crosses_vmd_domain(canonical) && self.module_loaded("pciehp") {
            if let Some(bdf) = cntrl::pci_address(canonical) {
                let slot = pci_slots
                    .iter()
                    .find(|s| s.matches_bdf(&bdf) && s.driver_is_pciehp());
                if let Some(slot) = slot {
                    return Some(Detection {
                        cntrl_type: CntrlType::Vmd,
                        cntrl_path: slot.sysfs_path.clone(),
                        enclosure_index: None,
                        ses_slot: None,
                    });
                }
            }
        }

        // 2. SES enclosure reachable over the SAS topology
        if let Some(sas) = cntrl::sas_address(canonical) {
            for (index, enclosure) in enclosures.iter().enumerate() {
                if let Some(slot) = enclosure.slot_by_sas(sas) {
                    return Some(Detection {
                        cntrl_type: CntrlType::ScsiSes,
                        cntrl_path: enclosure.sysfs_path.clone(),
                        enclosure_index: Some(index),
                        ses_slot: Some(slot),
                    });
                }
            }
        }

        // 3. NPEM capability on a parent port
        if let Some(dir) = cntrl::find_attribute_dir(canonical, "npem") {
            return Some(Detection {
                cntrl_type: CntrlType::Npem,
                cntrl_path: dir,
                enclosure_index: None,
                ses_slot: None,
            });
        }

        // 4. AHCI enclosure management, Intel or AMD flavor
        if self.ahci_em_enabled() {
            if amd_platform.uses_sgpio() {
                if let Some(dir) = cntrl::find_attribute_dir(canonical, "em_buffer") {
                    return Some(Detection {
                        cntrl_type: CntrlType::AmdSgpio,
                        cntrl_path: dir,
                        enclosure_index: None,
                        ses_slot: None,
                    });
                }
            }
            if let Some(dir) = cntrl::find_attribute_dir(canonical, "em_message") {
                return Some(Detection {
                    cntrl_type: CntrlType::Ahci,
                    cntrl_path: dir,
                    enclosure_index: None,
                    ses_slot: None,
                });
            }
        }

        // 5. AMD platforms with an MG9098 behind the BMC
        if amd_platform.uses_ipmi() {
            let cntrl_path = pci_function_dir(canonical).unwrap_or_else(|| canonical.to_path_buf());
            return Some(Detection {
                cntrl_type: CntrlType::AmdIpmi,
                cntrl_path,
                enclosure_index: None,
                ses_slot: None,
            });
        }

        None
    }
}

/// Deepest ancestor directory named like a PCI function.
fn pci_function_dir(canonical: &Path) -> Option<PathBuf> {
    let bdf = cntrl::pci_address(canonical)?;
    cntrl::ancestors(canonical)
        .into_iter()
        .find(|a| utils::basename(a) == bdf)
}

/// Allow/exclude and RAID-membership filtering.
///
/// A non-empty allow-list is authoritative. Otherwise the exclude-list
/// suppresses matches, except that RAID members are kept unconditionally
/// when only members are monitored.
fn retained(device: &BlockDevice, conf: &LedConf) -> bool {
    let is_member = device.raid_path.is_some();
    if !conf.allowlist.is_empty() {
        return utils::matches_prefix(&device.cntrl_path, &conf.allowlist);
    }
    if utils::matches_prefix(&device.cntrl_path, &conf.excludelist)
        && !(conf.raid_members_only && is_member)
    {
        warn!(
            "device '{}' excluded by EXCLUDELIST",
            device.sysfs_path.display()
        );
        return false;
    }
    if conf.raid_members_only && !is_member {
        return false;
    }
    true
}
