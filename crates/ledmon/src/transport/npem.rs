//! Native PCIe Enclosure Management transport
//!
//! One 4-bit control nibble per drive, written as decimal text to the
//! `npem` attribute of the capability-bearing port. The nibble packs the
//! attention and power indicators.

use std::path::Path;

use crate::ibpi::IbpiPattern;
use crate::status::Status;
use crate::utils;

/// Attention off, power on.
const NPEM_LOCATE: u8 = 0b0111;
/// Attention on, power off.
const NPEM_FAILURE: u8 = 0b1101;
/// Attention on, power on.
const NPEM_REBUILD: u8 = 0b0101;
/// Attention off, power off.
const NPEM_QUIET: u8 = 0b1111;

/// Control nibble for a pattern; shared with the VMD transport.
pub fn ibpi_value(pattern: IbpiPattern) -> Result<u8, Status> {
    match pattern.effective() {
        IbpiPattern::Locate => Ok(NPEM_LOCATE),
        IbpiPattern::Failure | IbpiPattern::LocateAndFailure => Ok(NPEM_FAILURE),
        IbpiPattern::Rebuild => Ok(NPEM_REBUILD),
        IbpiPattern::Ses(_) => Err(Status::NotSupported(
            "ses_* patterns need an SES enclosure".to_string(),
        )),
        IbpiPattern::Normal
        | IbpiPattern::Degraded
        | IbpiPattern::Hotspare
        | IbpiPattern::FailedArray
        | IbpiPattern::Pfa
        | IbpiPattern::LocateOff => Ok(NPEM_QUIET),
        other => Err(Status::OutOfRange(other.to_string())),
    }
}

/// Write the nibble; unchanged patterns are skipped, `locate_off` never is.
pub fn send(
    cntrl_path: &Path,
    previous: Option<IbpiPattern>,
    pattern: IbpiPattern,
) -> Result<bool, Status> {
    if cntrl_path.as_os_str().is_empty() {
        return Err(Status::InvalidPath("empty controller path".to_string()));
    }
    if previous == Some(pattern) && pattern != IbpiPattern::LocateOff {
        return Ok(false);
    }
    let value = ibpi_value(pattern)?;
    utils::write_text(&cntrl_path.join("npem"), &value.to_string())?;
    Ok(true)
}
