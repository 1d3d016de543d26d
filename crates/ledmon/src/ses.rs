//! SES-2 diagnostic page codec
//!
//! Pure byte-level parsing and encoding for the three pages the LED path
//! touches: 0x01 (configuration), 0x02 (enclosure status / control) and
//! 0x0A (additional element status, which carries per-slot SAS addresses).
//! All I/O lives in `transport::ses`.

use bitflags::bitflags;

use crate::ibpi::{IbpiPattern, SesCode};
use crate::status::Status;

pub const PAGE_CONFIGURATION: u8 = 0x01;
pub const PAGE_ENCLOSURE_STATUS: u8 = 0x02;
pub const PAGE_ADDITIONAL_ELEMENT_STATUS: u8 = 0x0A;

/// SES element types that represent drive slots.
const ELEMENT_TYPE_DEVICE_SLOT: u8 = 0x01;
const ELEMENT_TYPE_ARRAY_DEVICE_SLOT: u8 = 0x17;

/// SAS protocol identifier in additional-element-status descriptors.
const PROTOCOL_SAS: u8 = 0x06;

bitflags! {
    /// Control descriptor byte 0 (common control).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommonControl: u8 {
        const SELECT   = 0x80;
        const PRDFAIL  = 0x40;
        const DISABLE  = 0x20;
        const RST_SWAP = 0x10;
    }
}

bitflags! {
    /// Array-device-slot control/status byte 1.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SlotByte1: u8 {
        const OK           = 0x80;
        const RSVD_DEVICE  = 0x40;
        const HOT_SPARE    = 0x20;
        const CONS_CHECK   = 0x10;
        const IN_CRIT_ARRAY   = 0x08;
        const IN_FAILED_ARRAY = 0x04;
        const REBUILD      = 0x02;
        const ABORT        = 0x01;
    }
}

bitflags! {
    /// Array-device-slot control/status byte 2.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SlotByte2: u8 {
        const ACTIVE        = 0x80;
        const DO_NOT_REMOVE = 0x40;
        const MISSING       = 0x10;
        const INSERT        = 0x08;
        const REMOVE        = 0x04;
        const IDENT         = 0x02;
    }
}

bitflags! {
    /// Array-device-slot control byte 3 (status adds the sensed bit).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SlotByte3: u8 {
        const FAULT_SENSED = 0x40;
        const FAULT_REQSTD = 0x20;
        const DEVICE_OFF   = 0x10;
        const ENABLE_BYP_A = 0x08;
        const ENABLE_BYP_B = 0x04;
    }
}

/// Control bytes staged for one slot: `[common, byte1, byte2, byte3]`.
pub fn control_bytes(pattern: IbpiPattern) -> [u8; 4] {
    let select = CommonControl::SELECT.bits();
    match pattern {
        IbpiPattern::Locate => [select, 0, SlotByte2::IDENT.bits(), 0],
        IbpiPattern::Failure => [select, 0, 0, SlotByte3::FAULT_REQSTD.bits()],
        IbpiPattern::LocateAndFailure => [
            select,
            0,
            SlotByte2::IDENT.bits(),
            SlotByte3::FAULT_REQSTD.bits(),
        ],
        IbpiPattern::Rebuild => [select, SlotByte1::REBUILD.bits(), 0, 0],
        IbpiPattern::FailedArray => [select, SlotByte1::IN_FAILED_ARRAY.bits(), 0, 0],
        IbpiPattern::Degraded => [select, SlotByte1::IN_CRIT_ARRAY.bits(), 0, 0],
        IbpiPattern::Hotspare => [select, SlotByte1::HOT_SPARE.bits(), 0, 0],
        IbpiPattern::Pfa => [select | CommonControl::PRDFAIL.bits(), 0, 0, 0],
        IbpiPattern::Ses(code) => ses_control_bytes(code),
        // normal, oneshot_normal, locate_off and the bookkeeping states
        // clear every request bit
        _ => [select, 0, 0, 0],
    }
}

fn ses_control_bytes(code: SesCode) -> [u8; 4] {
    let select = CommonControl::SELECT.bits();
    match code {
        SesCode::Abort => [select, SlotByte1::ABORT.bits(), 0, 0],
        SesCode::Rebuild => [select, SlotByte1::REBUILD.bits(), 0, 0],
        SesCode::Ifa => [select, SlotByte1::IN_FAILED_ARRAY.bits(), 0, 0],
        SesCode::Ica => [select, SlotByte1::IN_CRIT_ARRAY.bits(), 0, 0],
        SesCode::ConsCheck => [select, SlotByte1::CONS_CHECK.bits(), 0, 0],
        SesCode::Hotspare => [select, SlotByte1::HOT_SPARE.bits(), 0, 0],
        SesCode::RsvdDev => [select, SlotByte1::RSVD_DEVICE.bits(), 0, 0],
        SesCode::Ok => [select, SlotByte1::OK.bits(), 0, 0],
        SesCode::Ident => [select, 0, SlotByte2::IDENT.bits(), 0],
        SesCode::Rm => [select, 0, SlotByte2::REMOVE.bits(), 0],
        SesCode::Insert => [select, 0, SlotByte2::INSERT.bits(), 0],
        SesCode::Missing => [select, 0, SlotByte2::MISSING.bits(), 0],
        SesCode::Dnr => [select, 0, SlotByte2::DO_NOT_REMOVE.bits(), 0],
        SesCode::Active => [select, 0, SlotByte2::ACTIVE.bits(), 0],
        SesCode::EnableBb => [select, 0, 0, SlotByte3::ENABLE_BYP_B.bits()],
        SesCode::EnableBa => [select, 0, 0, SlotByte3::ENABLE_BYP_A.bits()],
        SesCode::Devoff => [select, 0, 0, SlotByte3::DEVICE_OFF.bits()],
        SesCode::Fault => [select, 0, 0, SlotByte3::FAULT_REQSTD.bits()],
        SesCode::Prdfail => [select | CommonControl::PRDFAIL.bits(), 0, 0, 0],
    }
}

/// Interpret a slot's status bytes as the IBPI pattern the hardware shows.
///
/// This is the readback direction: after a flush the model is updated from
/// what the enclosure reports, not from what was requested.
pub fn pattern_from_status(status: [u8; 4]) -> IbpiPattern {
    let b1 = SlotByte1::from_bits_truncate(status[1]);
    let b2 = SlotByte2::from_bits_truncate(status[2]);
    let b3 = SlotByte3::from_bits_truncate(status[3]);
    let fault = b3.intersects(SlotByte3::FAULT_SENSED | SlotByte3::FAULT_REQSTD);
    let ident = b2.contains(SlotByte2::IDENT);
    if fault && ident {
        IbpiPattern::LocateAndFailure
    } else if fault {
        IbpiPattern::Failure
    } else if ident {
        IbpiPattern::Locate
    } else if b1.contains(SlotByte1::REBUILD) {
        IbpiPattern::Rebuild
    } else if b1.contains(SlotByte1::IN_FAILED_ARRAY) {
        IbpiPattern::FailedArray
    } else if b1.contains(SlotByte1::IN_CRIT_ARRAY) {
        IbpiPattern::Degraded
    } else if b1.contains(SlotByte1::HOT_SPARE) {
        IbpiPattern::Hotspare
    } else if CommonControl::from_bits_truncate(status[0]).contains(CommonControl::PRDFAIL) {
        IbpiPattern::Pfa
    } else {
        IbpiPattern::Normal
    }
}

/// Parsed view over an enclosure's diagnostic pages.
///
/// `slot_offsets` maps each drive-slot element (in SES element order) to
/// the byte offset of its 4-byte descriptor inside page 0x02.
#[derive(Debug, Clone)]
pub struct SesPages {
    pub page1: Vec<u8>,
    pub page2: Vec<u8>,
    slot_offsets: Vec<usize>,
    slot_addresses: Vec<Option<u64>>,
}

fn page_len(page: &[u8]) -> usize {
    u16::from_be_bytes([page[2], page[3]]) as usize + 4
}

fn check_page(page: &[u8], code: u8) -> Result<(), Status> {
    if page.len() < 8 {
        return Err(Status::SizeError {
            expected: 8,
            actual: page.len(),
        });
    }
    if page[0] != code {
        return Err(Status::DataError(format!(
            "expected diagnostic page {:#04x}, got {:#04x}",
            code, page[0]
        )));
    }
    if page_len(page) > page.len() {
        return Err(Status::SizeError {
            expected: page_len(page),
            actual: page.len(),
        });
    }
    Ok(())
}

/// Type descriptor headers from page 0x01: `(element_type, count)`.
fn type_headers(page1: &[u8]) -> Result<Vec<(u8, u8)>, Status> {
    let subenclosures = page1[1] as usize + 1;
    let mut offset = 8;
    let mut header_count = 0usize;
    for _ in 0..subenclosures {
        if offset + 4 > page1.len() {
            return Err(Status::DataError(
                "truncated enclosure descriptor list".to_string(),
            ));
        }
        header_count += page1[offset + 2] as usize;
        let descriptor_len = page1[offset + 3] as usize;
        offset += 4 + descriptor_len;
    }
    let mut headers = Vec::with_capacity(header_count);
    for _ in 0..header_count {
        if offset + 4 > page1.len() {
            return Err(Status::DataError(
                "truncated type descriptor header list".to_string(),
            ));
        }
        headers.push((page1[offset], page1[offset + 1]));
        offset += 4;
    }
    Ok(headers)
}

fn is_slot_type(element_type: u8) -> bool {
    element_type == ELEMENT_TYPE_DEVICE_SLOT || element_type == ELEMENT_TYPE_ARRAY_DEVICE_SLOT
}

impl SesPages {
    /// Parse the configuration and status pages; `page_a` is optional and
    /// only contributes SAS addresses.
    pub fn parse(page1: Vec<u8>, page2: Vec<u8>, page_a: Option<&[u8]>) -> Result<Self, Status> {
        check_page(&page1, PAGE_CONFIGURATION)?;
        check_page(&page2, PAGE_ENCLOSURE_STATUS)?;
        let headers = type_headers(&page1)?;

        // Page 2 carries, per type header, one overall descriptor followed
        // by `count` individual descriptors, 4 bytes each.
        let mut slot_offsets = Vec::new();
        let mut offset = 8;
        for (element_type, count) in &headers {
            offset += 4; // overall element
            for _ in 0..*count {
                if is_slot_type(*element_type) {
                    slot_offsets.push(offset);
                }
                offset += 4;
            }
        }
        if offset > page_len(&page2) {
            return Err(Status::SizeError {
                expected: offset,
                actual: page_len(&page2),
            });
        }

        let mut slot_addresses = vec![None; slot_offsets.len()];
        if let Some(page_a) = page_a {
            check_page(page_a, PAGE_ADDITIONAL_ELEMENT_STATUS)?;
            parse_slot_addresses(page_a, &mut slot_addresses);
        }

        Ok(SesPages {
            page1,
            page2,
            slot_offsets,
            slot_addresses,
        })
    }

    pub fn slot_count(&self) -> usize {
        self.slot_offsets.len()
    }

    /// Raw status bytes of a slot element.
    pub fn status_bytes(&self, slot: usize) -> Option<[u8; 4]> {
        let offset = *self.slot_offsets.get(slot)?;
        self.page2
            .get(offset..offset + 4)
            .map(|b| [b[0], b[1], b[2], b[3]])
    }

    /// SAS address of the drive in a slot, when page 0x0A reported one.
    pub fn slot_sas_address(&self, slot: usize) -> Option<u64> {
        self.slot_addresses.get(slot).copied().flatten()
    }

    /// IBPI-equivalent state a slot currently shows.
    pub fn slot_pattern(&self, slot: usize) -> IbpiPattern {
        self.status_bytes(slot)
            .map(pattern_from_status)
            .unwrap_or(IbpiPattern::Unknown)
    }

    /// Start a control page: a copy of the status page with the status
    /// byte and every element descriptor cleared, so un-selected elements
    /// are left alone by the enclosure processor.
    pub fn control_template(&self) -> Vec<u8> {
        let mut control = self.page2.clone();
        control[1] = 0;
        let headers = type_headers(&self.page1).unwrap_or_default();
        let mut offset = 8;
        for (_, count) in &headers {
            for _ in 0..=*count as usize {
                if offset + 4 <= control.len() {
                    control[offset..offset + 4].fill(0);
                }
                offset += 4;
            }
        }
        control
    }

    /// Stage a pattern request for one slot into a control page buffer.
    pub fn stage(&self, control: &mut [u8], slot: usize, pattern: IbpiPattern) -> Result<(), Status> {
        let offset = *self
            .slot_offsets
            .get(slot)
            .ok_or_else(|| Status::InvalidState(format!("no slot {slot}")))?;
        let bytes = control_bytes(pattern);
        control[offset..offset + 4].copy_from_slice(&bytes);
        Ok(())
    }

    /// Replace the cached status page after a readback.
    pub fn update_status(&mut self, page2: Vec<u8>) -> Result<(), Status> {
        check_page(&page2, PAGE_ENCLOSURE_STATUS)?;
        self.page2 = page2;
        Ok(())
    }
}

/// Pull per-slot SAS addresses out of page 0x0A.
///
/// Descriptors are walked by their embedded length; only SAS descriptors
/// with an element index are used. A malformed descriptor ends the walk
/// rather than failing the enclosure.
fn parse_slot_addresses(page_a: &[u8], out: &mut [Option<u64>]) {
    let end = page_len(page_a);
    let mut offset = 8;
    let mut implicit_index = 0usize;
    while offset + 2 <= end {
        let header = page_a[offset];
        let length = page_a[offset + 1] as usize + 2;
        if offset + length > end {
            break;
        }
        let eip = header & 0x10 != 0;
        let protocol = header & 0x0F;
        let invalid = header & 0x80 != 0;
        let index = if eip && offset + 3 < end {
            page_a[offset + 3] as usize
        } else {
            implicit_index
        };
        if !invalid && protocol == PROTOCOL_SAS {
            let body = if eip { offset + 4 } else { offset + 2 };
            let phy_count = page_a.get(body).copied().unwrap_or(0);
            // SAS address sits at bytes 12..20 of the first phy descriptor
            let phy = body + 4;
            if phy_count > 0 && phy + 20 <= end {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&page_a[phy + 12..phy + 20]);
                let addr = u64::from_be_bytes(raw);
                if addr != 0 {
                    if let Some(slot) = out.get_mut(index) {
                        *slot = Some(addr);
                    }
                }
            }
        }
        implicit_index += 1;
        offset += length;
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    #[test]
    fn test_parse_counts_slot_elements() {
        let pages = SesPages::parse(
            config_page(4),
            status_page(&[[0; 4]; 4]),
            None,
        )
        .unwrap();
        assert_eq!(pages.slot_count(), 4);
    }

    #[test]
    fn test_rejects_wrong_page_code() {
        let err = SesPages::parse(status_page(&[[0; 4]]), status_page(&[[0; 4]]), None);
        assert!(err.is_err());
    }

    #[test]
    fn test_slot_addresses_from_page_a() {
        let page_a = additional_page(&[(0, 0x5001_b4d5_1234_0001), (2, 0x5001_b4d5_1234_0003)]);
        let pages = SesPages::parse(
            config_page(3),
            status_page(&[[0; 4]; 3]),
            Some(page_a.as_slice()),
        )
        .unwrap();
        assert_eq!(pages.slot_sas_address(0), Some(0x5001_b4d5_1234_0001));
        assert_eq!(pages.slot_sas_address(1), None);
        assert_eq!(pages.slot_sas_address(2), Some(0x5001_b4d5_1234_0003));
    }

    #[test]
    fn test_control_bit_placement() {
        assert_eq!(control_bytes(IbpiPattern::Locate), [0x80, 0, 0x02, 0]);
        assert_eq!(control_bytes(IbpiPattern::Failure), [0x80, 0, 0, 0x20]);
        assert_eq!(control_bytes(IbpiPattern::Rebuild), [0x80, 0x02, 0, 0]);
        assert_eq!(control_bytes(IbpiPattern::Hotspare), [0x80, 0x20, 0, 0]);
        assert_eq!(control_bytes(IbpiPattern::Pfa), [0xC0, 0, 0, 0]);
        assert_eq!(control_bytes(IbpiPattern::Normal), [0x80, 0, 0, 0]);
        assert_eq!(control_bytes(IbpiPattern::LocateOff), [0x80, 0, 0, 0]);
        assert_eq!(
            control_bytes(IbpiPattern::LocateAndFailure),
            [0x80, 0, 0x02, 0x20]
        );
    }

    #[test]
    fn test_stage_touches_only_target_element() {
        let pages = SesPages::parse(
            config_page(8),
            status_page(&[[0; 4]; 8]),
            None,
        )
        .unwrap();
        let mut control = pages.control_template();
        pages.stage(&mut control, 7, IbpiPattern::Failure).unwrap();
        // element 7 sits after the overall element at offset 8
        let offset = 8 + 4 + 7 * 4;
        assert_eq!(&control[offset..offset + 4], &[0x80, 0, 0, 0x20]);
        for other in 0..7 {
            let o = 8 + 4 + other * 4;
            assert_eq!(&control[o..o + 4], &[0u8; 4], "element {other}");
        }
    }

    #[test]
    fn test_pattern_from_status_prefers_fault() {
        assert_eq!(
            pattern_from_status([0, 0, 0x02, 0x40]),
            IbpiPattern::LocateAndFailure
        );
        assert_eq!(pattern_from_status([0, 0, 0, 0x20]), IbpiPattern::Failure);
        assert_eq!(pattern_from_status([0, 0, 0x02, 0]), IbpiPattern::Locate);
        assert_eq!(pattern_from_status([0, 0x02, 0, 0]), IbpiPattern::Rebuild);
        assert_eq!(pattern_from_status([0x01, 0, 0, 0]), IbpiPattern::Normal);
    }

    #[test]
    fn test_ses_direct_codes_select_their_bits() {
        use crate::ibpi::SesCode;
        assert_eq!(
            control_bytes(IbpiPattern::Ses(SesCode::Dnr)),
            [0x80, 0, 0x40, 0]
        );
        assert_eq!(
            control_bytes(IbpiPattern::Ses(SesCode::Devoff)),
            [0x80, 0, 0, 0x10]
        );
        assert_eq!(
            control_bytes(IbpiPattern::Ses(SesCode::Ok)),
            [0x80, 0x80, 0, 0]
        );
    }
}
