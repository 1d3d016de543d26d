//! LED-capable controllers and backplane-type detection
//!
//! Detection walks a block device's canonical sysfs ancestry and applies
//! the documented rules in order; the first match decides which transport
//! owns the device's LEDs.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::utils;

/// Backplane technology behind a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CntrlType {
    Ahci,
    ScsiSes,
    Npem,
    Vmd,
    AmdSgpio,
    AmdIpmi,
}

impl CntrlType {
    /// Name accepted by `ledctl --controller-type` and printed in listings.
    pub fn name(self) -> &'static str {
        match self {
            CntrlType::Ahci => "AHCI",
            CntrlType::ScsiSes => "SCSI",
            CntrlType::Npem => "NPEM",
            CntrlType::Vmd => "VMD",
            CntrlType::AmdSgpio => "AMD_SGPIO",
            CntrlType::AmdIpmi => "AMD_IPMI",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "AHCI" => Some(CntrlType::Ahci),
            "SCSI" | "SES" => Some(CntrlType::ScsiSes),
            "NPEM" => Some(CntrlType::Npem),
            "VMD" => Some(CntrlType::Vmd),
            "AMD_SGPIO" => Some(CntrlType::AmdSgpio),
            "AMD_IPMI" => Some(CntrlType::AmdIpmi),
            _ => None,
        }
    }
}

/// AMD platform family, from the DMI product name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AmdPlatform {
    #[default]
    None,
    /// SGPIO backplanes.
    Grandstand,
    Speedway,
    /// IPMI/MG9098 backplanes.
    EthanolX,
    DaytonaX,
}

impl AmdPlatform {
    /// Read the platform selector from `<sysfs_root>/class/dmi/id/product_name`.
    pub fn detect(sysfs_root: &Path) -> Self {
        let name = utils::read_text(&sysfs_root.join("class/dmi/id/product_name"))
            .unwrap_or_default()
            .to_ascii_uppercase();
        Self::from_product_name(&name)
    }

    pub fn from_product_name(name: &str) -> Self {
        let upper = name.to_ascii_uppercase();
        if upper.contains("GRANDSTAND") {
            AmdPlatform::Grandstand
        } else if upper.contains("SPEEDWAY") {
            AmdPlatform::Speedway
        } else if upper.contains("ETHANOL") {
            AmdPlatform::EthanolX
        } else if upper.contains("DAYTONA") {
            AmdPlatform::DaytonaX
        } else {
            AmdPlatform::None
        }
    }

    pub fn uses_sgpio(self) -> bool {
        matches!(self, AmdPlatform::Grandstand | AmdPlatform::Speedway)
    }

    pub fn uses_ipmi(self) -> bool {
        matches!(self, AmdPlatform::EthanolX | AmdPlatform::DaytonaX)
    }
}

/// One LED-capable controller discovered during a scan.
#[derive(Debug, Clone)]
pub struct Controller {
    pub cntrl_type: CntrlType,
    /// Sysfs path of the LED-message sink (host dir, NPEM capability
    /// holder, VMD slot or enclosure device).
    pub sysfs_path: PathBuf,
}

static HOST_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"host(\d+)").expect("valid host regex"));
static ATA_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"/ata(\d+)/").expect("valid ata regex"));
static VMD_DOMAIN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/pci(1[0-9a-f]{4}):").expect("valid vmd domain regex"));
static PCI_FUNC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-f]{4,5}:[0-9a-f]{2}:[0-9a-f]{2}\.[0-9a-f]$").expect("valid bdf regex")
});

/// Last SCSI host index found in the path, if any.
pub fn host_index(path: &Path) -> Option<u32> {
    let text = path.to_string_lossy();
    HOST_RE
        .captures_iter(&text)
        .last()
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// ATA port number embedded in the path, if any.
pub fn ata_port(path: &Path) -> Option<u32> {
    let text = path.to_string_lossy();
    ATA_RE
        .captures_iter(&text)
        .last()
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// True when the path crosses a VMD PCIe domain (domain id >= 0x10000).
pub fn crosses_vmd_domain(path: &Path) -> bool {
    VMD_DOMAIN_RE.is_match(&path.to_string_lossy())
}

/// PCI `domain:bus:device.function` address of the deepest PCI function in
/// the path.
pub fn pci_address(path: &Path) -> Option<String> {
    path.components()
        .filter_map(|c| {
            let text = c.as_os_str().to_string_lossy();
            PCI_FUNC_RE.is_match(&text).then(|| text.into_owned())
        })
        .last()
}

/// Ancestors of `path` from the deepest directory upward.
pub fn ancestors(path: &Path) -> Vec<PathBuf> {
    path.ancestors().map(Path::to_path_buf).collect()
}

/// Find the closest ancestor directory containing `attr`, checking the
/// plain layout and the `scsi_host/<host>` sub-layout used by libata.
pub fn find_attribute_dir(path: &Path, attr: &str) -> Option<PathBuf> {
    for ancestor in ancestors(path) {
        if ancestor.join(attr).is_file() {
            return Some(ancestor);
        }
        let name = utils::basename(&ancestor);
        if name.starts_with("host") {
            let nested = ancestor.join("scsi_host").join(&name);
            if nested.join(attr).is_file() {
                return Some(nested);
            }
        }
    }
    None
}

/// Closest ancestor with a `sas_address` attribute, returning the address.
pub fn sas_address(path: &Path) -> Option<u64> {
    for ancestor in ancestors(path) {
        if let Some(addr) = utils::read_hex(&ancestor.join("sas_address")) {
            return Some(addr);
        }
        // sas end devices keep their attributes one level down
        let name = utils::basename(&ancestor);
        if name.starts_with("end_device-") {
            let nested = ancestor.join("sas_device").join(&name).join("sas_address");
            if let Some(addr) = utils::read_hex(&nested) {
                return Some(addr);
            }
        }
    }
    None
}
