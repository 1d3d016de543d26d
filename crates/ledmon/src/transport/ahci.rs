//! Intel AHCI enclosure-management transport
//!
//! One 32-bit SGPIO message per port, written as decimal text to the
//! controller's `em_message` attribute. The controller needs a minimum
//! gap between EM commands, honored with a fixed pre-write delay.

use std::path::Path;
use std::time::Duration;

use crate::config::{AhciLocateOffValue, LedConf};
use crate::ibpi::IbpiPattern;
use crate::status::Status;
use crate::utils;

/// Minimum inter-command gap of the EM mailbox.
const EM_MSG_WAIT: Duration = Duration::from_micros(1500);

const EM_MSG_LED_REBUILD: u32 = 0x0048_0000;
const EM_MSG_LED_FAILURE: u32 = 0x0040_0000;
const EM_MSG_LED_LOCATE: u32 = 0x0008_0000;
const EM_MSG_LED_OFF: u32 = 0x0000_0000;

/// 32-bit EM message for a pattern.
///
/// The composite locate+failure cannot be expressed in one message; it
/// degrades to the failure value. `locate_off` is configurable because
/// legacy backplanes expect the locate value as the off command.
pub fn ibpi_value(pattern: IbpiPattern, locate_off: AhciLocateOffValue) -> Result<u32, Status> {
    match pattern.effective() {
        IbpiPattern::Rebuild => Ok(EM_MSG_LED_REBUILD),
        IbpiPattern::Failure | IbpiPattern::LocateAndFailure => Ok(EM_MSG_LED_FAILURE),
        IbpiPattern::Locate => Ok(EM_MSG_LED_LOCATE),
        IbpiPattern::LocateOff => Ok(match locate_off {
            AhciLocateOffValue::Zero => EM_MSG_LED_OFF,
            AhciLocateOffValue::Locate => EM_MSG_LED_LOCATE,
        }),
        IbpiPattern::Ses(_) => Err(Status::NotSupported(
            "ses_* patterns need an SES enclosure".to_string(),
        )),
        IbpiPattern::Normal
        | IbpiPattern::Degraded
        | IbpiPattern::Hotspare
        | IbpiPattern::FailedArray
        | IbpiPattern::Pfa => Ok(EM_MSG_LED_OFF),
        other => Err(Status::OutOfRange(other.to_string())),
    }
}

/// Stage-and-commit in one step; AHCI has no batching.
///
/// Returns `true` when a message was written. An unchanged pattern is
/// skipped, except `locate_off` which is always re-emitted.
pub fn send(
    cntrl_path: &Path,
    previous: Option<IbpiPattern>,
    pattern: IbpiPattern,
    conf: &LedConf,
) -> Result<bool, Status> {
    if cntrl_path.as_os_str().is_empty() {
        return Err(Status::InvalidPath("empty controller path".to_string()));
    }
    if previous == Some(pattern) && pattern != IbpiPattern::LocateOff {
        return Ok(false);
    }
    let value = ibpi_value(pattern, conf.ahci_locate_off_value)?;
    std::thread::sleep(EM_MSG_WAIT);
    utils::write_text(&cntrl_path.join("em_message"), &value.to_string())?;
    Ok(true)
}
