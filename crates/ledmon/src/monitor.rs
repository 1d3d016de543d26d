//! Monitor state and the per-scan dispatcher
//!
//! The monitor owns the long-lived device list that carries LED state
//! across scans. One tick runs: inventory scan, merge observations into
//! the list, revalidate controller bindings, send changed patterns, flush
//! per controller, invalidate scan-local bindings.

use std::path::{Path, PathBuf};

use tracing::{debug, error, info};

use crate::config::LedConf;
use crate::ibpi::{self, IbpiPattern};
use crate::sysfs::{BlockDevice, CntrlType, Scanner, Snapshot};
use crate::transport::{self, LedRequest, SendContext};

/// Udev actions the monitor reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdevAction {
    Add,
    Remove,
}

/// One device carried across scans.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub name: String,
    pub sysfs_path: PathBuf,
    pub cntrl_path: PathBuf,
    pub cntrl_type: CntrlType,
    pub host_id: Option<u32>,
    /// Scan-local enclosure binding, refreshed every scan.
    pub enclosure_index: Option<usize>,
    pub ses_slot: Option<usize>,
    pub ibpi: IbpiPattern,
    pub ibpi_prev: IbpiPattern,
    /// Scan epoch the device was last observed in.
    pub timestamp: u64,
    pub raid_path: Option<PathBuf>,
}

impl DeviceRecord {
    fn from_scan(device: &BlockDevice, epoch: u64) -> Self {
        DeviceRecord {
            name: device.name.clone(),
            sysfs_path: device.sysfs_path.clone(),
            cntrl_path: device.cntrl_path.clone(),
            cntrl_type: device.cntrl_type,
            host_id: device.host_id,
            enclosure_index: device.enclosure_index,
            ses_slot: device.ses_slot,
            ibpi: device.ibpi,
            ibpi_prev: IbpiPattern::Unknown,
            timestamp: epoch,
            raid_path: device.raid_path.clone(),
        }
    }
}

/// The LED monitor core, shared by the daemon loop.
pub struct Monitor {
    pub conf: LedConf,
    scanner: Scanner,
    devices: Vec<DeviceRecord>,
    epoch: u64,
    /// Transport side channels, parameterized for tests.
    pub sgpio_cache_path: PathBuf,
    pub ipmi_path: PathBuf,
}

impl Monitor {
    pub fn new(conf: LedConf, scanner: Scanner) -> Self {
        Monitor {
            conf,
            scanner,
            devices: Vec::new(),
            epoch: 0,
            sgpio_cache_path: PathBuf::from(transport::amd_sgpio::CACHE_PATH),
            ipmi_path: PathBuf::from("/dev/ipmi0"),
        }
    }

    pub fn devices(&self) -> &[DeviceRecord] {
        &self.devices
    }

    /// One full scan-and-dispatch pass.
    pub fn tick(&mut self) {
        let snapshot = self.scanner.scan(&self.conf);
        self.reconcile(snapshot);
    }

    /// Dispatch against an already-built snapshot (the testable core of
    /// [`Monitor::tick`]).
    pub fn reconcile(&mut self, mut snapshot: Snapshot) {
        self.epoch += 1;
        let epoch = self.epoch;

        // 1. merge this scan's observations into the long-lived list
        for device in &snapshot.block_devices {
            self.absorb(device, epoch);
        }

        // arrays that vanished release their members
        for record in &mut self.devices {
            if let Some(raid_path) = &record.raid_path {
                if !snapshot.raids.iter().any(|r| &r.sysfs_path == raid_path) {
                    debug!(
                        "array '{}' is gone, releasing '{}'",
                        raid_path.display(),
                        record.sysfs_path.display()
                    );
                    record.raid_path = None;
                }
            }
        }

        // 2. revalidate controller bindings against this snapshot
        let mut any_revalidate_failed = false;
        let revalidated: Vec<bool> = self
            .devices
            .iter()
            .map(|record| {
                let ok = snapshot.find_controller(&record.cntrl_path).is_some();
                if !ok {
                    any_revalidate_failed = true;
                    debug!(
                        "controller '{}' not found for '{}'",
                        record.cntrl_path.display(),
                        record.sysfs_path.display()
                    );
                }
                ok
            })
            .collect();

        // 3+4. send in enumeration order, then flush once per controller
        {
            let Snapshot {
                ref mut enclosures,
                ref pci_slots,
                ref controllers,
                amd_platform,
                ..
            } = snapshot;
            let mut ctx = SendContext::new(&self.conf, enclosures, pci_slots, amd_platform);
            ctx.sgpio_cache_path = self.sgpio_cache_path.clone();
            ctx.ipmi_path = self.ipmi_path.clone();

            for (record, ok) in self.devices.iter_mut().zip(&revalidated) {
                if !*ok {
                    continue;
                }
                // a device that vanished without a remove event still must
                // show failure on its LED
                if record.timestamp != epoch && record.ibpi != IbpiPattern::Failure {
                    debug!("detached dev: '{}' in failed state", record.sysfs_path.display());
                    set_pattern(record, IbpiPattern::Failure);
                }
                if record.ibpi == IbpiPattern::Unknown || record.ibpi == record.ibpi_prev {
                    continue;
                }
                let req = LedRequest {
                    cntrl_type: record.cntrl_type,
                    cntrl_path: &record.cntrl_path,
                    device_path: &record.sysfs_path,
                    enclosure_index: record.enclosure_index,
                    ses_slot: record.ses_slot,
                    previous: Some(record.ibpi_prev),
                };
                match transport::send(&req, record.ibpi, &mut ctx) {
                    Ok(_) => record.ibpi_prev = record.ibpi,
                    Err(err) => {
                        error!("'{}': {}", record.sysfs_path.display(), err);
                    }
                }
            }

            for controller in controllers {
                if let Err(err) =
                    transport::flush(controller.cntrl_type, &controller.sysfs_path, &mut ctx)
                {
                    error!("'{}': {}", controller.sysfs_path.display(), err);
                }
            }
        }

        // 5. invalidate scan-local bindings
        for record in &mut self.devices {
            if record.timestamp != epoch {
                record.enclosure_index = None;
                record.ses_slot = None;
            }
        }
        if any_revalidate_failed {
            // stale controller references must not accumulate; the next
            // scan rebuilds the list from scratch
            info!("controller topology changed, rebuilding device list");
            self.devices.clear();
        }
    }

    /// Merge one scanned device into the long-lived list.
    fn absorb(&mut self, device: &BlockDevice, epoch: u64) {
        if let Some(record) = self
            .devices
            .iter_mut()
            .find(|r| r.sysfs_path == device.sysfs_path)
        {
            record.timestamp = epoch;
            record.cntrl_path = device.cntrl_path.clone();
            record.cntrl_type = device.cntrl_type;
            record.host_id = device.host_id;
            record.enclosure_index = device.enclosure_index;
            record.ses_slot = device.ses_slot;
            record.raid_path = device.raid_path.clone();
            let next = ibpi::merge(record.ibpi, device.ibpi);
            set_pattern(record, next);
            return;
        }

        // a renamed device keeps its identity: same sink, same slot, and
        // absent from this scan under its old path
        if let Some(record) = self.devices.iter_mut().find(|r| {
            r.timestamp != epoch
                && r.cntrl_path == device.cntrl_path
                && r.cntrl_type == device.cntrl_type
                && r.host_id == device.host_id
                && r.ses_slot == device.ses_slot
        }) {
            record.timestamp = epoch;
            record.name = device.name.clone();
            record.sysfs_path = device.sysfs_path.clone();
            record.enclosure_index = device.enclosure_index;
            record.raid_path = device.raid_path.clone();
            // only the path changed; no transition is logged
            record.ibpi = ibpi::merge(record.ibpi, device.ibpi);
            return;
        }

        self.devices.push(DeviceRecord::from_scan(device, epoch));
    }

    /// React to a block-device uevent between scans.
    pub fn handle_udev(&mut self, action: UdevAction, devpath: &Path) {
        let Some(record) = self
            .devices
            .iter_mut()
            .find(|r| r.sysfs_path == devpath || devpath.ends_with(&r.sysfs_path))
        else {
            return;
        };
        match action {
            UdevAction::Add => {
                // failure and removal survive a re-add; everything else
                // becomes a pending arrival
                if !matches!(record.ibpi, IbpiPattern::Failure | IbpiPattern::Removed) {
                    set_pattern(record, IbpiPattern::Added);
                }
            }
            UdevAction::Remove => {
                set_pattern(record, IbpiPattern::Removed);
            }
        }
    }
}

/// Record a pattern transition, logging every visible change.
fn set_pattern(record: &mut DeviceRecord, next: IbpiPattern) {
    if record.ibpi != next {
        info!(
            "CHANGE {}: from '{}' to '{}'",
            record.sysfs_path.display(),
            record.ibpi,
            next
        );
        record.ibpi = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::symlink;

    /// Synthetic sysfs tree: two SATA disks behind one AHCI controller.
    struct Rig {
        _dir: tempfile::TempDir,
        root: PathBuf,
        host: PathBuf,
    }

    impl Rig {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().to_path_buf();
            fs::create_dir_all(root.join("block")).unwrap();
            let params = root.join("module/libahci/parameters");
            fs::create_dir_all(&params).unwrap();
            fs::write(params.join("ahci_em_messages"), "1\n").unwrap();
            let host = root.join("devices/pci0000:00/0000:00:17.0/ata1/host0");
            fs::create_dir_all(&host).unwrap();
            fs::write(host.join("em_message"), "0").unwrap();
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
            dev
        }

        fn remove_disk(&self, name: &str) {
            fs::remove_file(self.root.join("block").join(name)).unwrap();
        }

        fn em_message(&self) -> String {
            fs::read_to_string(self.host.join("em_message")).unwrap()
        }

        fn monitor(&self) -> Monitor {
            let scanner = Scanner::with_roots(self.root.clone(), PathBuf::from("/dev"));
            Monitor::new(LedConf::default(), scanner)
        }
    }

    #[test]
    fn test_first_scan_populates_long_lived_list() {
        let rig = Rig::new();
        rig.add_disk("sda", "target0:0:0/0:0:0:0");
        rig.add_disk("sdb", "target0:0:1/0:0:1:0");
        let mut monitor = rig.monitor();
        monitor.tick();
        assert_eq!(monitor.devices().len(), 2);
        // no RAID membership: nothing to emit
        assert!(monitor
            .devices()
            .iter()
            .all(|r| r.ibpi == IbpiPattern::Unknown));
    }

    #[test]
    fn test_udev_remove_emits_failure_next_tick() {
        let rig = Rig::new();
        let sda = rig.add_disk("sda", "target0:0:0/0:0:0:0");
        rig.add_disk("sdb", "target0:0:1/0:0:1:0");
        let mut monitor = rig.monitor();
        monitor.tick();

        monitor.handle_udev(UdevAction::Remove, &sda);
        // the device disappears from the kernel too
        rig.remove_disk("sda");
        monitor.tick();

        // the removed device resolved to failure and its LED was written
        let record = monitor
            .devices()
            .iter()
            .find(|r| r.name == "sda")
            .expect("sda stays in the list while its controller exists");
        assert_eq!(record.ibpi, IbpiPattern::Failure);
        assert_eq!(record.ibpi_prev, IbpiPattern::Failure);
        assert_eq!(rig.em_message(), format!("{}", 0x0040_0000));
    }

    #[test]
    fn test_detached_device_without_uevent_fails_too() {
        let rig = Rig::new();
        rig.add_disk("sda", "target0:0:0/0:0:0:0");
        rig.add_disk("sdb", "target0:0:1/0:0:1:0");
        let mut monitor = rig.monitor();
        monitor.tick();
        rig.remove_disk("sda");
        monitor.tick();
        let record = monitor.devices().iter().find(|r| r.name == "sda").unwrap();
        assert_eq!(record.ibpi, IbpiPattern::Failure);
    }

    #[test]
    fn test_udev_add_becomes_oneshot_normal() {
        let rig = Rig::new();
        let sda = rig.add_disk("sda", "target0:0:0/0:0:0:0");
        let mut monitor = rig.monitor();
        monitor.tick();
        monitor.handle_udev(UdevAction::Add, &sda);
        assert_eq!(monitor.devices()[0].ibpi, IbpiPattern::Added);
        monitor.tick();
        assert_eq!(monitor.devices()[0].ibpi, IbpiPattern::OneshotNormal);
        // the one-shot turns the LED off once
        assert_eq!(rig.em_message(), "0");
        monitor.tick();
        assert_eq!(monitor.devices()[0].ibpi, IbpiPattern::Unknown);
    }

    #[test]
    fn test_revalidate_failure_clears_list() {
        let rig = Rig::new();
        rig.add_disk("sda", "target0:0:0/0:0:0:0");
        let mut monitor = rig.monitor();
        monitor.tick();
        assert_eq!(monitor.devices().len(), 1);
        // the whole controller disappears: no devices, no controllers
        rig.remove_disk("sda");
        monitor.tick();
        assert!(monitor.devices().is_empty());
    }

    #[test]
    fn test_renamed_device_keeps_record() {
        let rig = Rig::new();
        rig.add_disk("sda", "target0:0:0/0:0:0:0");
        let mut monitor = rig.monitor();
        monitor.tick();
        let before = monitor.devices()[0].sysfs_path.clone();

        // same controller and host, new kernel name and canonical path
        rig.remove_disk("sda");
        fs::remove_dir_all(rig.host.join("target0:0:0")).unwrap();
        rig.add_disk("sdc", "target0:0:0/0:0:0:1");
        monitor.tick();

        assert_eq!(monitor.devices().len(), 1);
        let record = &monitor.devices()[0];
        assert_eq!(record.name, "sdc");
        assert_ne!(record.sysfs_path, before);
    }
}
