//! Block devices as seen by one scan

use std::path::PathBuf;

use crate::ibpi::IbpiPattern;
use crate::sysfs::cntrl::CntrlType;

/// One physical block device captured in a scan snapshot.
///
/// Identity is the canonical sysfs path; the controller path is the LED
/// sink and may outlive the device's physical presence. Snapshot bindings
/// (`cntrl_index`, `enclosure_index`) are valid only for the scan that
/// produced them.
#[derive(Debug, Clone)]
pub struct BlockDevice {
    /// Short kernel name, e.g. `sda` or `nvme0n1`.
    pub name: String,
    /// Canonical sysfs path; devices with the same canonical path are the
    /// same device even when the short name changes.
    pub sysfs_path: PathBuf,
    /// Canonical path of the LED-message sink.
    pub cntrl_path: PathBuf,
    pub cntrl_type: CntrlType,
    /// SCSI host index for SAS/SATA paths.
    pub host_id: Option<u32>,
    /// Index of the owning controller in the snapshot; cleared at the end
    /// of each scan.
    pub cntrl_index: Option<usize>,
    /// Enclosure and slot-element indices for SCSI-SES devices.
    pub enclosure_index: Option<usize>,
    pub ses_slot: Option<usize>,
    /// Pattern accumulated from RAID membership during this scan.
    pub ibpi: IbpiPattern,
    /// Sysfs path of the array this device is a member of, if any.
    pub raid_path: Option<PathBuf>,
}

impl BlockDevice {
    pub fn new(name: String, sysfs_path: PathBuf, cntrl_type: CntrlType, cntrl_path: PathBuf) -> Self {
        BlockDevice {
            name,
            sysfs_path,
            cntrl_path,
            cntrl_type,
            host_id: None,
            cntrl_index: None,
            enclosure_index: None,
            ses_slot: None,
            ibpi: IbpiPattern::Unknown,
            raid_path: None,
        }
    }

    /// Fold another suggested pattern into this scan's observation.
    pub fn suggest(&mut self, pattern: IbpiPattern) {
        self.ibpi = self.ibpi.accumulate(pattern);
    }
}
