//! Transport dispatch
//!
//! Every block device is bound to exactly one backplane transport at
//! inventory time; this module routes send/flush calls to the right
//! encoder. Sends may be immediate (AHCI, NPEM, VMD, AMD) or staged for a
//! per-controller flush (SES).

pub mod ahci;
pub mod amd_ipmi;
pub mod amd_sgpio;
pub mod npem;
pub mod ses;
pub mod vmd;

use std::path::{Path, PathBuf};

use crate::config::LedConf;
use crate::ibpi::IbpiPattern;
use crate::status::Status;
use crate::sysfs::{cntrl, AmdPlatform, CntrlType, Enclosure, PciSlot};

/// Environment one send/flush operates in, derived from the scan snapshot
/// and the runtime configuration.
pub struct SendContext<'a> {
    pub conf: &'a LedConf,
    pub enclosures: &'a mut Vec<Enclosure>,
    pub pci_slots: &'a [PciSlot],
    pub amd_platform: AmdPlatform,
    /// Shared AMD-SGPIO LED cache; a tempfile in tests.
    pub sgpio_cache_path: PathBuf,
    /// BMC message device for the IPMI transport.
    pub ipmi_path: PathBuf,
}

impl<'a> SendContext<'a> {
    pub fn new(
        conf: &'a LedConf,
        enclosures: &'a mut Vec<Enclosure>,
        pci_slots: &'a [PciSlot],
        amd_platform: AmdPlatform,
    ) -> Self {
        SendContext {
            conf,
            enclosures,
            pci_slots,
            amd_platform,
            sgpio_cache_path: PathBuf::from(amd_sgpio::CACHE_PATH),
            ipmi_path: PathBuf::from("/dev/ipmi0"),
        }
    }
}

/// One LED request: where the pattern goes and what was last emitted.
pub struct LedRequest<'a> {
    pub cntrl_type: CntrlType,
    pub cntrl_path: &'a Path,
    /// Canonical sysfs path of the block device (port and bay numbers are
    /// derived from it).
    pub device_path: &'a Path,
    pub enclosure_index: Option<usize>,
    pub ses_slot: Option<usize>,
    pub previous: Option<IbpiPattern>,
}

/// Route a pattern to the device's transport.
///
/// Returns `true` when a write was issued or staged; `false` when the
/// transport decided the hardware already shows the pattern.
pub fn send(req: &LedRequest<'_>, pattern: IbpiPattern, ctx: &mut SendContext<'_>) -> Result<bool, Status> {
    match req.cntrl_type {
        CntrlType::Ahci => ahci::send(req.cntrl_path, req.previous, pattern, ctx.conf),
        CntrlType::Npem => npem::send(req.cntrl_path, req.previous, pattern),
        CntrlType::Vmd => {
            // the slot binding is revalidated on every send; a slot that
            // lost its pciehp driver is a dead sink
            let slot = match cntrl::pci_address(req.device_path) {
                Some(bdf) => vmd::resolve_slot(ctx.pci_slots, &bdf)?,
                // empty slots are addressed by the slot path directly
                None => ctx
                    .pci_slots
                    .iter()
                    .find(|s| s.sysfs_path == req.cntrl_path && s.driver_is_pciehp())
                    .ok_or_else(|| {
                        Status::InvalidController(format!(
                            "hot-plug slot '{}' disappeared",
                            req.cntrl_path.display()
                        ))
                    })?,
            };
            vmd::send(&slot.sysfs_path, req.previous, pattern)
        }
        CntrlType::ScsiSes => {
            let index = req.enclosure_index.ok_or_else(|| {
                Status::InvalidController(format!(
                    "'{}' has no enclosure binding",
                    req.device_path.display()
                ))
            })?;
            let slot = req.ses_slot.ok_or_else(|| {
                Status::InvalidController(format!(
                    "'{}' has no slot binding",
                    req.device_path.display()
                ))
            })?;
            let enclosure = ctx.enclosures.get_mut(index).ok_or_else(|| {
                Status::InvalidController(format!("enclosure {index} is gone"))
            })?;
            ses::send(enclosure, slot, req.previous, pattern)
        }
        CntrlType::AmdSgpio => {
            let port = cntrl::ata_port(req.device_path).ok_or_else(|| {
                Status::InvalidPath(format!(
                    "'{}' has no ATA port in its path",
                    req.device_path.display()
                ))
            })?;
            amd_sgpio::send(
                req.cntrl_path,
                &ctx.sgpio_cache_path,
                port,
                req.previous,
                pattern,
            )
        }
        CntrlType::AmdIpmi => {
            let bay = ipmi_drive_bay(req.device_path, ctx)?;
            let mut dev = amd_ipmi::IpmiDevice::open(&ctx.ipmi_path)?;
            // a backplane that does not answer as an MG9098 gets no writes
            amd_ipmi::verify_backplane(&mut dev, ctx.amd_platform, bay)?;
            amd_ipmi::set_pattern(&mut dev, ctx.amd_platform, bay, req.previous, pattern)
        }
    }
}

/// Commit a controller's batched state; a no-op for the unbatched
/// transports.
pub fn flush(cntrl_type: CntrlType, cntrl_path: &Path, ctx: &mut SendContext<'_>) -> Result<(), Status> {
    match cntrl_type {
        CntrlType::ScsiSes => {
            let enclosure = ctx
                .enclosures
                .iter_mut()
                .find(|e| e.sysfs_path == cntrl_path)
                .ok_or_else(|| {
                    Status::InvalidController(format!(
                        "enclosure '{}' is gone",
                        cntrl_path.display()
                    ))
                })?;
            ses::flush(enclosure)
        }
        _ => Ok(()),
    }
}

/// Drive bay for the IPMI platforms.
///
/// SATA bays follow the ATA port number. NVMe bays come from the hot-plug
/// slot number; Daytona-X numbers its NVMe slots two above the bay.
fn ipmi_drive_bay(device_path: &Path, ctx: &SendContext<'_>) -> Result<u8, Status> {
    if let Some(port) = cntrl::ata_port(device_path) {
        return Ok(port as u8);
    }
    let bdf = cntrl::pci_address(device_path).ok_or_else(|| {
        Status::InvalidPath(format!(
            "'{}' has neither an ATA port nor a PCI address",
            device_path.display()
        ))
    })?;
    let slot = ctx
        .pci_slots
        .iter()
        .find(|s| s.matches_bdf(&bdf))
        .ok_or_else(|| Status::InvalidController(format!("no hot-plug slot for {bdf}")))?;
    let number: u8 = slot
        .number()
        .parse()
        .map_err(|_| Status::DataError(format!("slot name '{}' is not a number", slot.number())))?;
    Ok(match ctx.amd_platform {
        AmdPlatform::DaytonaX => number.saturating_sub(2),
        _ => number,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_ipmi_drive_bay_daytona_nvme_adjustment() {
        let conf = LedConf::default();
        let mut enclosures = Vec::new();
        let slots = vec![PciSlot {
            sysfs_path: PathBuf::from("/sys/bus/pci/slots/23"),
            address: "10003:01:00".to_string(),
            attention: None,
        }];
        let ctx = SendContext {
            conf: &conf,
            enclosures: &mut enclosures,
            pci_slots: &slots,
            amd_platform: AmdPlatform::DaytonaX,
            sgpio_cache_path: PathBuf::new(),
            ipmi_path: PathBuf::new(),
        };
        let device = Path::new(
            "/sys/devices/pci10003:00/10003:01:00.0/nvme/nvme0/nvme0n1",
        );
        assert_eq!(ipmi_drive_bay(device, &ctx).unwrap(), 21);
    }

    #[test]
    fn test_ipmi_drive_bay_sata_uses_ata_port() {
        let conf = LedConf::default();
        let mut enclosures = Vec::new();
        let ctx = SendContext {
            conf: &conf,
            enclosures: &mut enclosures,
            pci_slots: &[],
            amd_platform: AmdPlatform::EthanolX,
            sgpio_cache_path: PathBuf::new(),
            ipmi_path: PathBuf::new(),
        };
        let device = Path::new(
            "/sys/devices/pci0000:00/0000:00:08.1/ata5/host4/target4:0:0/4:0:0:0/block/sda",
        );
        assert_eq!(ipmi_drive_bay(device, &ctx).unwrap(), 5);
    }

    #[test]
    fn test_send_routes_to_ahci() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("em_message"), "0").unwrap();
        let conf = LedConf::default();
        let mut enclosures = Vec::new();
        let mut ctx = SendContext::new(&conf, &mut enclosures, &[], AmdPlatform::None);
        let req = LedRequest {
            cntrl_type: CntrlType::Ahci,
            cntrl_path: dir.path(),
            device_path: Path::new("/sys/devices/fake/block/sda"),
            enclosure_index: None,
            ses_slot: None,
            previous: None,
        };
        assert!(send(&req, IbpiPattern::Failure, &mut ctx).unwrap());
        assert_eq!(
            fs::read_to_string(dir.path().join("em_message")).unwrap(),
            format!("{}", 0x0040_0000)
        );
    }

    #[test]
    fn test_ses_send_requires_enclosure_binding() {
        let conf = LedConf::default();
        let mut enclosures = Vec::new();
        let mut ctx = SendContext::new(&conf, &mut enclosures, &[], AmdPlatform::None);
        let req = LedRequest {
            cntrl_type: CntrlType::ScsiSes,
            cntrl_path: Path::new("/sys/class/enclosure/1:0:2:0"),
            device_path: Path::new("/sys/devices/fake/block/sdb"),
            enclosure_index: None,
            ses_slot: None,
            previous: None,
        };
        let err = send(&req, IbpiPattern::Locate, &mut ctx).unwrap_err();
        assert_eq!(err.exit_code(), crate::status::exit_code::INVALID_CONTROLLER);
    }
}
