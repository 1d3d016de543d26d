//! SCSI / SES-2 transport
//!
//! Sends are staged per enclosure: each request edits one element of a
//! control page built from the last status read. Flush writes the page in
//! a single SEND DIAGNOSTIC transaction and immediately reads page 0x02
//! back, so the model reflects what the hardware accepted rather than
//! what was requested.

use std::fs::File;

use tracing::warn;

use crate::ibpi::IbpiPattern;
use crate::sg;
use crate::ses::PAGE_ENCLOSURE_STATUS;
use crate::status::Status;
use crate::sysfs::Enclosure;

/// Stage a pattern for one slot element.
///
/// Returns `true` when a request was staged. Repeating the currently
/// shown state is suppressed with a warning, except `locate_off` which is
/// always staged to clear a prior locate.
pub fn send(
    enclosure: &mut Enclosure,
    slot: usize,
    previous: Option<IbpiPattern>,
    pattern: IbpiPattern,
) -> Result<bool, Status> {
    let shown = enclosure
        .slots
        .get(slot)
        .map(|s| s.ibpi)
        .ok_or_else(|| Status::InvalidState(format!("enclosure has no slot {slot}")))?;
    if pattern != IbpiPattern::LocateOff && (previous == Some(pattern) || shown == pattern.effective())
    {
        return Ok(false);
    }
    if pattern == IbpiPattern::LocateOff
        && !matches!(shown, IbpiPattern::Locate | IbpiPattern::LocateAndFailure)
    {
        warn!(
            "slot {} of '{}' shows {}, locate already off",
            slot,
            enclosure.sysfs_path.display(),
            shown
        );
        return Ok(false);
    }
    let mut control = enclosure
        .pending
        .take()
        .unwrap_or_else(|| enclosure.pages.control_template());
    enclosure.pages.stage(&mut control, slot, pattern)?;
    enclosure.pending = Some(control);
    Ok(true)
}

/// Commit staged requests and fold the hardware's answer back in.
pub fn flush(enclosure: &mut Enclosure) -> Result<(), Status> {
    let Some(control) = enclosure.pending.take() else {
        return Ok(());
    };
    let file = File::options()
        .read(true)
        .write(true)
        .open(&enclosure.dev_path)
        .map_err(|source| Status::FileOpen {
            path: enclosure.dev_path.clone(),
            source,
        })?;
    sg::send_diagnostic(&file, &enclosure.dev_path, &control)?;
    // hardware may silently refuse or normalize bits; readback is the
    // only truth
    let page2 = sg::receive_diagnostic(&file, &enclosure.dev_path, PAGE_ENCLOSURE_STATUS)?;
    apply_readback(enclosure, page2)
}

/// Replace the cached status page and recompute every slot's state.
///
/// Split from [`flush`] so the merge is testable without sg hardware; a
/// failed readback never reaches this point and the model stays on the
/// previous page.
pub fn apply_readback(enclosure: &mut Enclosure, page2: Vec<u8>) -> Result<(), Status> {
    enclosure.pages.update_status(page2)?;
    enclosure.rebuild_slots();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ses::testutil::{config_page, status_page};
    use crate::ses::SesPages;
    use std::path::PathBuf;

    fn enclosure(slot_status: &[[u8; 4]]) -> Enclosure {
        let pages =
            SesPages::parse(config_page(slot_status.len() as u8), status_page(slot_status), None)
                .unwrap();
        Enclosure::from_pages(
            PathBuf::from("/sys/class/enclosure/1:0:2:0"),
            PathBuf::from("/dev/sg1"),
            0xABCD,
            pages,
        )
    }

    #[test]
    fn test_send_stages_fault_bit_for_target_element() {
        let mut enc = enclosure(&[[0; 4]; 8]);
        assert!(send(&mut enc, 7, None, IbpiPattern::Failure).unwrap());
        let control = enc.pending.as_ref().expect("staged page");
        let offset = 8 + 4 + 7 * 4;
        assert_eq!(&control[offset..offset + 4], &[0x80, 0, 0, 0x20]);
    }

    #[test]
    fn test_send_skips_when_hardware_already_shows_pattern() {
        // slot 0 already shows locate
        let mut enc = enclosure(&[[0, 0, 0x02, 0]]);
        assert!(!send(&mut enc, 0, None, IbpiPattern::Locate).unwrap());
        assert!(enc.pending.is_none());
    }

    #[test]
    fn test_locate_off_clears_an_active_locate() {
        // slot 0 shows locate; locate_off must go out even if it was the
        // last request too
        let mut enc = enclosure(&[[0, 0, 0x02, 0]]);
        assert!(send(&mut enc, 0, Some(IbpiPattern::LocateOff), IbpiPattern::LocateOff).unwrap());
        assert!(enc.pending.is_some());
    }

    #[test]
    fn test_locate_off_on_cleared_slot_warns_and_skips() {
        let mut enc = enclosure(&[[0; 4]]);
        assert!(!send(&mut enc, 0, None, IbpiPattern::LocateOff).unwrap());
        assert!(enc.pending.is_none());
    }

    #[test]
    fn test_readback_overrides_requested_state() {
        let mut enc = enclosure(&[[0; 4]]);
        assert!(send(&mut enc, 0, None, IbpiPattern::Locate).unwrap());
        enc.pending.take();
        // the enclosure refused ident and reports fault instead
        let answer = status_page(&[[0, 0, 0, 0x40]]);
        apply_readback(&mut enc, answer).unwrap();
        assert_eq!(enc.slots[0].ibpi, IbpiPattern::Failure);
    }

    #[test]
    fn test_batched_requests_share_one_page(){
        let mut enc = enclosure(&[[0; 4]; 4]);
        assert!(send(&mut enc, 1, None, IbpiPattern::Locate).unwrap());
        assert!(send(&mut enc, 3, None, IbpiPattern::Rebuild).unwrap());
        let control = enc.pending.as_ref().unwrap();
        let slot1 = 8 + 4 + 4;
        let slot3 = 8 + 4 + 3 * 4;
        assert_eq!(&control[slot1..slot1 + 4], &[0x80, 0, 0x02, 0]);
        assert_eq!(&control[slot3..slot3 + 4], &[0x80, 0x02, 0, 0]);
    }
}
