//! Intel VMD transport
//!
//! NVMe drives behind a VMD domain expose their LEDs through the pciehp
//! attention register of the matching hot-plug slot. The nibble encoding
//! is shared with NPEM.

use std::path::Path;

use crate::ibpi::IbpiPattern;
use crate::status::Status;
use crate::sysfs::PciSlot;
use crate::transport::npem;
use crate::utils;

/// Find the hot-plug slot holding the PCI function at `bdf`.
pub fn resolve_slot<'a>(pci_slots: &'a [PciSlot], bdf: &str) -> Result<&'a PciSlot, Status> {
    let slot = pci_slots
        .iter()
        .find(|slot| slot.matches_bdf(bdf))
        .ok_or_else(|| Status::InvalidController(format!("no hot-plug slot for {bdf}")))?;
    if !slot.driver_is_pciehp() {
        return Err(Status::InvalidController(format!(
            "slot {} is not driven by pciehp",
            slot.number()
        )));
    }
    Ok(slot)
}

/// Write the attention nibble to the slot; same skip rules as NPEM.
pub fn send(
    slot_path: &Path,
    previous: Option<IbpiPattern>,
    pattern: IbpiPattern,
) -> Result<bool, Status> {
    if slot_path.as_os_str().is_empty() {
        return Err(Status::InvalidPath("empty slot path".to_string()));
    }
    if previous == Some(pattern) && pattern != IbpiPattern::LocateOff {
        return Ok(false);
    }
    let value = npem::ibpi_value(pattern)?;
    utils::write_text(&slot_path.join("attention"), &value.to_string())?;
    Ok(true)
}
