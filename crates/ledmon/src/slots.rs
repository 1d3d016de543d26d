//! Unified slot view and the control-utility core
//!
//! `ledctl` works on two shapes: named block devices (pattern mode) and
//! controller slots (slot mode). Both resolve to the same inventory
//! snapshot; a [`Slot`] is the polymorphic view over SES slots, NPEM
//! controllers, VMD hot-plug slots and AHCI ports.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::config::LedConf;
use crate::ibpi::IbpiPattern;
use crate::status::Status;
use crate::sysfs::{CntrlType, Scanner, Snapshot};
use crate::transport::{self, LedRequest, SendContext};
use crate::utils;

/// One LED-capable slot, uniform across backplane technologies.
#[derive(Debug, Clone)]
pub struct Slot {
    pub cntrl_type: CntrlType,
    /// Stable identifier: enclosure path + element index for SES, slot
    /// number for VMD, sink path for NPEM and AHCI.
    pub id: String,
    /// Kernel name of the attached block device, when occupied.
    pub device: Option<String>,
    pub state: IbpiPattern,
    cntrl_path: PathBuf,
    device_path: Option<PathBuf>,
    enclosure_index: Option<usize>,
    ses_slot: Option<usize>,
}

/// Reverse of the NPEM/VMD nibble table, for slot listings.
fn pattern_from_nibble(value: u64) -> IbpiPattern {
    match value {
        0b0111 => IbpiPattern::Locate,
        0b1101 => IbpiPattern::Failure,
        0b0101 => IbpiPattern::Rebuild,
        0b1111 => IbpiPattern::Normal,
        _ => IbpiPattern::Unknown,
    }
}

/// Enumerate the slots of every controller of one type.
pub fn list(snapshot: &Snapshot, cntrl_type: CntrlType) -> Vec<Slot> {
    let device_at = |enclosure_index: usize, element: usize| {
        snapshot
            .block_devices
            .iter()
            .find(|d| d.enclosure_index == Some(enclosure_index) && d.ses_slot == Some(element))
    };
    let device_on = |cntrl_path: &Path| {
        snapshot
            .block_devices
            .iter()
            .find(|d| d.cntrl_path == cntrl_path)
    };

    let mut slots = Vec::new();
    match cntrl_type {
        CntrlType::ScsiSes => {
            for (index, enclosure) in snapshot.enclosures.iter().enumerate() {
                for slot in &enclosure.slots {
                    let device = device_at(index, slot.element_index);
                    slots.push(Slot {
                        cntrl_type,
                        id: format!(
                            "{}/{}",
                            enclosure.sysfs_path.display(),
                            slot.element_index
                        ),
                        device: device.map(|d| d.name.clone()),
                        state: slot.ibpi,
                        cntrl_path: enclosure.sysfs_path.clone(),
                        device_path: device.map(|d| d.sysfs_path.clone()),
                        enclosure_index: Some(index),
                        ses_slot: Some(slot.element_index),
                    });
                }
            }
        }
        CntrlType::Vmd => {
            for pci_slot in snapshot.pci_slots.iter().filter(|s| s.driver_is_pciehp()) {
                let device = device_on(&pci_slot.sysfs_path);
                slots.push(Slot {
                    cntrl_type,
                    id: pci_slot.number(),
                    device: device.map(|d| d.name.clone()),
                    state: pci_slot
                        .attention
                        .map(pattern_from_nibble)
                        .unwrap_or(IbpiPattern::Unknown),
                    cntrl_path: pci_slot.sysfs_path.clone(),
                    device_path: device.map(|d| d.sysfs_path.clone()),
                    enclosure_index: None,
                    ses_slot: None,
                });
            }
        }
        CntrlType::Npem | CntrlType::Ahci | CntrlType::AmdSgpio | CntrlType::AmdIpmi => {
            for controller in snapshot
                .controllers
                .iter()
                .filter(|c| c.cntrl_type == cntrl_type)
            {
                let device = device_on(&controller.sysfs_path);
                let state = if cntrl_type == CntrlType::Npem {
                    utils::read_u64(&controller.sysfs_path.join("npem"))
                        .map(pattern_from_nibble)
                        .unwrap_or(IbpiPattern::Unknown)
                } else {
                    // write-only sinks report no state
                    IbpiPattern::Unknown
                };
                slots.push(Slot {
                    cntrl_type,
                    id: controller.sysfs_path.display().to_string(),
                    device: device.map(|d| d.name.clone()),
                    state,
                    cntrl_path: controller.sysfs_path.clone(),
                    device_path: device.map(|d| d.sysfs_path.clone()),
                    enclosure_index: None,
                    ses_slot: None,
                });
            }
        }
    }
    slots
}

/// Find one slot by its identifier.
pub fn get_by_id(snapshot: &Snapshot, cntrl_type: CntrlType, id: &str) -> Result<Slot, Status> {
    list(snapshot, cntrl_type)
        .into_iter()
        .find(|slot| slot.id == id)
        .ok_or_else(|| Status::InvalidState(format!("no slot '{id}'")))
}

/// Find the slot holding a named device.
pub fn get_by_device(
    snapshot: &Snapshot,
    cntrl_type: CntrlType,
    scanner: &Scanner,
    device: &str,
) -> Result<Slot, Status> {
    let canonical = resolve_device_path(scanner, device)?;
    list(snapshot, cntrl_type)
        .into_iter()
        .find(|slot| slot.device_path.as_deref() == Some(canonical.as_path()))
        .ok_or_else(|| Status::InvalidPath(format!("'{device}' occupies no {} slot", cntrl_type.name())))
}

/// Apply a pattern to one slot.
///
/// Idempotent for every pattern but `locate_off`: a slot already showing
/// the requested state is left alone.
pub fn set(
    snapshot: &mut Snapshot,
    conf: &LedConf,
    slot: &Slot,
    pattern: IbpiPattern,
) -> Result<(), Status> {
    // write-only sinks report Unknown and are never skipped
    if slot.state != IbpiPattern::Unknown
        && pattern == slot.state.effective()
        && pattern != IbpiPattern::LocateOff
    {
        info!("slot '{}' already shows {}", slot.id, pattern);
        return Ok(());
    }
    let Snapshot {
        ref mut enclosures,
        ref pci_slots,
        amd_platform,
        ..
    } = *snapshot;
    let mut ctx = SendContext::new(conf, enclosures, pci_slots, amd_platform);
    let device_path = slot.device_path.clone().unwrap_or_else(|| slot.cntrl_path.clone());
    let req = LedRequest {
        cntrl_type: slot.cntrl_type,
        cntrl_path: &slot.cntrl_path,
        device_path: &device_path,
        enclosure_index: slot.enclosure_index,
        ses_slot: slot.ses_slot,
        previous: None,
    };
    transport::send(&req, pattern, &mut ctx)?;
    transport::flush(slot.cntrl_type, &slot.cntrl_path, &mut ctx)
}

/// Resolve a user-supplied device argument to a canonical sysfs path.
///
/// Accepted forms: `/dev/<name>`, `/sys/block/<name>`,
/// `/sys/class/block/<name>`, a bare name, or `major:minor` (resolved
/// through `/sys/dev/block`).
pub fn resolve_device_path(scanner: &Scanner, input: &str) -> Result<PathBuf, Status> {
    let not_found = || Status::InvalidPath(input.to_string());

    if !input.contains('/') && input.contains(':') {
        let link = scanner.sysfs_root.join("dev/block").join(input);
        return utils::canonicalize(&link).ok_or_else(not_found);
    }
    let name = Path::new(input)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .ok_or_else(not_found)?;
    let candidates = [
        scanner.sysfs_root.join("block").join(&name),
        scanner.sysfs_root.join("class/block").join(&name),
    ];
    candidates
        .iter()
        .filter(|p| p.exists())
        .find_map(|p| utils::canonicalize(p))
        .ok_or_else(not_found)
}

/// Pattern-mode core: emit the requested pattern on every listed device,
/// optionally quieting every unlisted one first.
pub fn apply_patterns(
    snapshot: &mut Snapshot,
    conf: &LedConf,
    requests: &[(IbpiPattern, PathBuf)],
    listed_only: bool,
) -> Result<(), Status> {
    if requests.is_empty() {
        return Err(Status::ListEmpty);
    }
    let wanted: HashMap<&Path, IbpiPattern> = requests
        .iter()
        .map(|(pattern, path)| (path.as_path(), *pattern))
        .collect();

    // every listed device must exist in the inventory before anything is
    // emitted
    for (_, path) in requests {
        if snapshot.find_block(path).is_none() {
            return Err(Status::InvalidPath(path.display().to_string()));
        }
    }

    let Snapshot {
        ref block_devices,
        ref mut enclosures,
        ref pci_slots,
        ref controllers,
        amd_platform,
        ..
    } = *snapshot;
    let mut ctx = SendContext::new(conf, enclosures, pci_slots, amd_platform);

    for device in block_devices {
        let pattern = match wanted.get(device.sysfs_path.as_path()) {
            Some(pattern) => *pattern,
            // stale LEDs on unlisted devices are cleared unless suppressed
            None if !listed_only => IbpiPattern::LocateOff,
            None => continue,
        };
        let req = LedRequest {
            cntrl_type: device.cntrl_type,
            cntrl_path: &device.cntrl_path,
            device_path: &device.sysfs_path,
            enclosure_index: device.enclosure_index,
            ses_slot: device.ses_slot,
            previous: None,
        };
        transport::send(&req, pattern, &mut ctx)?;
    }
    for controller in controllers {
        transport::flush(controller.cntrl_type, &controller.sysfs_path, &mut ctx)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::symlink;

    struct Rig {
        _dir: tempfile::TempDir,
        root: PathBuf,
        host: PathBuf,
    }

    impl Rig {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().to_path_buf();
            let params = root.join("module/libahci/parameters");
            fs::create_dir_all(&params).unwrap();
            fs::write(params.join("ahci_em_messages"), "1\n").unwrap();
            let host = root.join("devices/pci0000:00/0000:00:17.0/ata1/host0");
            fs::create_dir_all(&host).unwrap();
            fs::write(host.join("em_message"), "0").unwrap();
            fs::create_dir_all(root.join("block")).unwrap();
            Rig {
                _dir: dir,
                root,
                host,
            }
        }

        fn add_disk(&self, name: &str, target: &str) -> PathBuf {
            let dev = self.host.join(format!("{target}/block/{name}"));
            fs::create_dir_all(&dev).unwrap();
            symlink(&dev, self.root.join("block").join(name)).unwrap();
            let majmin_dir = self.root.join("dev/block");
            fs::create_dir_all(&majmin_dir).unwrap();
            symlink(&dev, majmin_dir.join("8:0")).ok();
            dev
        }

        fn scanner(&self) -> Scanner {
            Scanner::with_roots(self.root.clone(), PathBuf::from("/dev"))
        }
    }

    #[test]
    fn test_resolve_device_path_forms() {
        let rig = Rig::new();
        let dev = rig.add_disk("sda", "target0:0:0/0:0:0:0");
        let scanner = rig.scanner();
        for form in ["/dev/sda", "/sys/block/sda", "/sys/class/block/sda", "sda"] {
            // class/block is absent in the fake tree; block/ resolves it
            assert_eq!(resolve_device_path(&scanner, form).unwrap(), dev, "{form}");
        }
        assert_eq!(resolve_device_path(&scanner, "8:0").unwrap(), dev);
        let err = resolve_device_path(&scanner, "/dev/nvme9n9").unwrap_err();
        assert_eq!(err.exit_code(), crate::status::exit_code::INVALID_PATH);
    }

    #[test]
    fn test_apply_pattern_writes_listed_device() {
        let rig = Rig::new();
        let dev = rig.add_disk("sda", "target0:0:0/0:0:0:0");
        let scanner = rig.scanner();
        let conf = LedConf::default();
        let mut snapshot = scanner.scan(&conf);
        let canonical = utils::canonicalize(&dev).unwrap();
        apply_patterns(
            &mut snapshot,
            &conf,
            &[(IbpiPattern::Locate, canonical)],
            true,
        )
        .unwrap();
        assert_eq!(
            fs::read_to_string(rig.host.join("em_message")).unwrap(),
            "524288"
        );
    }

    #[test]
    fn test_apply_pattern_quiets_unlisted_devices() {
        let rig = Rig::new();
        let dev_a = rig.add_disk("sda", "target0:0:0/0:0:0:0");
        // second disk on its own controller so both sinks are observable
        let host2 = rig.root.join("devices/pci0000:00/0000:00:1f.2/ata2/host1");
        fs::create_dir_all(&host2).unwrap();
        fs::write(host2.join("em_message"), "seed").unwrap();
        let dev_b = host2.join("target1:0:0/1:0:0:0/block/sdb");
        fs::create_dir_all(&dev_b).unwrap();
        symlink(&dev_b, rig.root.join("block/sdb")).unwrap();

        let scanner = rig.scanner();
        let conf = LedConf::default();
        let mut snapshot = scanner.scan(&conf);
        let canonical = utils::canonicalize(&dev_a).unwrap();
        apply_patterns(
            &mut snapshot,
            &conf,
            &[(IbpiPattern::Locate, canonical)],
            false,
        )
        .unwrap();
        // the unlisted sdb got locate_off (zero by default)
        assert_eq!(fs::read_to_string(host2.join("em_message")).unwrap(), "0");
    }

    #[test]
    fn test_unknown_listed_device_aborts_before_emission() {
        let rig = Rig::new();
        rig.add_disk("sda", "target0:0:0/0:0:0:0");
        let scanner = rig.scanner();
        let conf = LedConf::default();
        let mut snapshot = scanner.scan(&conf);
        let err = apply_patterns(
            &mut snapshot,
            &conf,
            &[(IbpiPattern::Locate, PathBuf::from("/nonexistent"))],
            true,
        )
        .unwrap_err();
        assert_eq!(err.exit_code(), crate::status::exit_code::INVALID_PATH);
        // nothing was written
        assert_eq!(
            fs::read_to_string(rig.host.join("em_message")).unwrap(),
            "0"
        );
    }

    #[test]
    fn test_empty_request_list() {
        let rig = Rig::new();
        let scanner = rig.scanner();
        let conf = LedConf::default();
        let mut snapshot = scanner.scan(&conf);
        let err = apply_patterns(&mut snapshot, &conf, &[], true).unwrap_err();
        assert_eq!(err.exit_code(), crate::status::exit_code::LIST_EMPTY);
    }

    #[test]
    fn test_list_ahci_slots() {
        let rig = Rig::new();
        rig.add_disk("sda", "target0:0:0/0:0:0:0");
        let scanner = rig.scanner();
        let conf = LedConf::default();
        let snapshot = scanner.scan(&conf);
        let slots = list(&snapshot, CntrlType::Ahci);
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].device.as_deref(), Some("sda"));
        assert_eq!(slots[0].state, IbpiPattern::Unknown);
    }

    #[test]
    fn test_set_slot_is_idempotent_except_locate_off() {
        let rig = Rig::new();
        rig.add_disk("sda", "target0:0:0/0:0:0:0");
        let scanner = rig.scanner();
        let conf = LedConf::default();
        let mut snapshot = scanner.scan(&conf);
        let mut slot = list(&snapshot, CntrlType::Ahci).remove(0);
        slot.state = IbpiPattern::Locate;
        fs::write(rig.host.join("em_message"), "sentinel").unwrap();
        // same state requested: nothing written
        set(&mut snapshot, &conf, &slot, IbpiPattern::Locate).unwrap();
        assert_eq!(
            fs::read_to_string(rig.host.join("em_message")).unwrap(),
            "sentinel"
        );
        // locate_off always goes out
        set(&mut snapshot, &conf, &slot, IbpiPattern::LocateOff).unwrap();
        assert_eq!(fs::read_to_string(rig.host.join("em_message")).unwrap(), "0");
    }
}
