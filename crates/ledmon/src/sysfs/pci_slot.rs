//! Hot-plug PCIe slots
//!
//! VMD exposes per-drive attention LEDs through `/sys/bus/pci/slots/<n>`;
//! a slot is usable only when the hot-plug driver behind it is pciehp.

use std::path::{Path, PathBuf};

use crate::utils;

/// One hot-plug-capable PCIe slot.
#[derive(Debug, Clone)]
pub struct PciSlot {
    pub sysfs_path: PathBuf,
    /// `domain:bus:device` text from the slot's `address` attribute.
    pub address: String,
    /// Current attention register value, when readable.
    pub attention: Option<u64>,
}

impl PciSlot {
    pub fn from_sysfs(slot_dir: &Path) -> Option<Self> {
        let address = utils::read_text(&slot_dir.join("address"))?;
        let attention = utils::read_u64(&slot_dir.join("attention"));
        Some(PciSlot {
            sysfs_path: slot_dir.to_path_buf(),
            address,
            attention,
        })
    }

    /// True when the slot's `module` symlink resolves to the pciehp driver.
    pub fn driver_is_pciehp(&self) -> bool {
        utils::canonicalize(&self.sysfs_path.join("module"))
            .map(|target| utils::basename(&target) == "pciehp")
            .unwrap_or(false)
    }

    /// Slot number, the directory basename.
    pub fn number(&self) -> String {
        utils::basename(&self.sysfs_path)
    }

    /// True when this slot holds the PCI function at `bdf`
    /// (`domain:bus:device.function`); the slot address has no function
    /// part.
    pub fn matches_bdf(&self, bdf: &str) -> bool {
        bdf.split('.').next() == Some(self.address.as_str())
    }
}

/// Scan `<sysfs_root>/bus/pci/slots`.
pub fn scan_pci_slots(sysfs_root: &Path) -> Vec<PciSlot> {
    utils::list_dir(&sysfs_root.join("bus/pci/slots"))
        .iter()
        .filter_map(|dir| PciSlot::from_sysfs(dir))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_scan_reads_address_and_attention() {
        let dir = tempfile::tempdir().unwrap();
        let slot = dir.path().join("bus/pci/slots/4");
        fs::create_dir_all(&slot).unwrap();
        fs::write(slot.join("address"), "10000:01:00\n").unwrap();
        fs::write(slot.join("attention"), "6\n").unwrap();
        let slots = scan_pci_slots(dir.path());
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].address, "10000:01:00");
        assert_eq!(slots[0].attention, Some(6));
        assert_eq!(slots[0].number(), "4");
    }

    #[test]
    fn test_bdf_matching_ignores_function() {
        let slot = PciSlot {
            sysfs_path: PathBuf::from("/sys/bus/pci/slots/4"),
            address: "10000:01:00".to_string(),
            attention: None,
        };
        assert!(slot.matches_bdf("10000:01:00.0"));
        assert!(!slot.matches_bdf("10000:02:00.0"));
    }
}
