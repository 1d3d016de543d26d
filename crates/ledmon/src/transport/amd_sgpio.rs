//! AMD SGPIO transport
//!
//! LEDs are driven by writing SGPIO register frames into the host's
//! `em_buffer`. Each frame is a 4-byte header, an 8-byte request and a
//! register payload. Blink rates come from two hardware blink generators
//! shared by all drives on a controller, so the last-committed LED bytes
//! and the generator assignments live in a file-backed cache shared with
//! the control utility; the cache is flocked for the whole set-pattern
//! operation and rolled back if any frame write fails.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ibpi::IbpiPattern;
use crate::status::Status;

/// Default location of the shared LED cache.
pub const CACHE_PATH: &str = "/dev/shm/ledmon_amd_sgpio_cache";
/// Cache file size: 64 entries of 16 bytes, one entry per 4-drive bank.
pub const CACHE_SIZE: usize = 1024;
const ENTRY_SIZE: usize = 16;

pub const HEADER_SIZE: usize = 4;
pub const REQUEST_SIZE: usize = 8;
pub const CFG_SIZE: usize = 16;
pub const TRANSMIT_SIZE: usize = 16;
pub const AMD_SIZE: usize = 12;

const MSG_TYPE_SGPIO: u8 = 0x03;
const FRAME_TYPE: u8 = 0x40;
const FUNCTION_WRITE: u8 = 0x82;

/// Inter-write gap required by the EM buffer.
const WRITE_DELAY: Duration = Duration::from_millis(1);
/// EBUSY retry budget.
const WRITE_RETRIES: u32 = 3;

/// Register groups addressed by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterType {
    Cfg = 0x00,
    Tx = 0x03,
    Amd = 0xC0,
}

/// The two hardware blink generators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlinkGen {
    A,
    B,
}

/// Generator rates (register nibbles) used by the LED table.
pub const BLINK_RATE_LOCATE: u8 = 0x4;
pub const BLINK_RATE_REBUILD: u8 = 0x2;

/// Message header: type, payload size, message size (request + payload).
pub fn header(data_size: u8, msg_size: u16) -> [u8; HEADER_SIZE] {
    let msg = msg_size.to_le_bytes();
    [MSG_TYPE_SGPIO, data_size, msg[0], msg[1]]
}

/// Register write request.
pub fn request(reg_type: RegisterType, reg_index: u8, reg_count: u8) -> [u8; REQUEST_SIZE] {
    [
        FRAME_TYPE,
        FUNCTION_WRITE,
        reg_type as u8,
        reg_index,
        reg_count,
        0,
        0,
        0,
    ]
}

/// CFG register payload: blink generator rates plus the fixed activity
/// policy (forced off, max-on 2) and the enable bit.
pub fn cfg_payload(blink_gen_a: u8, blink_gen_b: u8) -> [u8; CFG_SIZE] {
    let mut payload = [0u8; CFG_SIZE];
    payload[8] = (blink_gen_b << 4) | (blink_gen_a & 0x0F);
    payload[9] = (2 << 4) | 0x01; // max_activity_on=2, force_activity_off=1
    payload[11] = 0x01; // sgpio_enable
    payload
}

/// AMD register payload: initiator select, bypass and return-to-normal.
pub fn amd_payload(initiator: bool, polarity_flip: bool) -> [u8; AMD_SIZE] {
    let mut payload = [0u8; AMD_SIZE];
    payload[0] = (initiator as u8)
        | ((polarity_flip as u8) << 1)
        | (1 << 2)  // bypass_enable
        | (1 << 3); // return_to_normal
    payload
}

/// TX register payload: one LED byte per drive of the bank.
pub fn tx_payload(leds: [u8; 4]) -> [u8; TRANSMIT_SIZE] {
    let mut payload = [0u8; TRANSMIT_SIZE];
    payload[..4].copy_from_slice(&leds);
    payload
}

/// A complete frame ready for the em_buffer.
fn frame(reg_type: RegisterType, payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(HEADER_SIZE + REQUEST_SIZE + payload.len());
    bytes.extend_from_slice(&header(
        payload.len() as u8,
        (REQUEST_SIZE + payload.len()) as u16,
    ));
    bytes.extend_from_slice(&request(reg_type, 0, 1));
    bytes.extend_from_slice(payload);
    bytes
}

/// LED field values: error is a 3-bit field (bits 7..5), locate a 2-bit
/// field (bits 4..3), activity a 3-bit field (bits 2..0). Value 1 is
/// solid on; 2 and 3 select blink generator A and B.
fn field_on() -> u8 {
    0b001
}

fn field_blink(gen: BlinkGen) -> u8 {
    match gen {
        BlinkGen::A => 0b010,
        BlinkGen::B => 0b011,
    }
}

/// LED byte for one drive, keyed by pattern and the generator that holds
/// the pattern's blink rate.
pub fn drive_led(pattern: IbpiPattern, gen: BlinkGen) -> u8 {
    match pattern.effective() {
        IbpiPattern::Locate => field_blink(gen) << 3,
        IbpiPattern::Failure | IbpiPattern::FailedArray => field_on() << 5,
        IbpiPattern::LocateAndFailure => (field_on() << 5) | (field_blink(gen) << 3),
        IbpiPattern::Rebuild | IbpiPattern::Pfa => field_blink(gen) << 5,
        _ => 0,
    }
}

/// Blink rate a pattern needs, `None` for steady patterns.
fn blink_rate(pattern: IbpiPattern) -> Option<u8> {
    match pattern.effective() {
        IbpiPattern::Locate | IbpiPattern::LocateAndFailure => Some(BLINK_RATE_LOCATE),
        IbpiPattern::Rebuild | IbpiPattern::Pfa => Some(BLINK_RATE_REBUILD),
        _ => None,
    }
}

/// One 4-drive cache entry.
///
/// Layout: generator rates at bytes 0..2, LED bytes at 4..8, the rest
/// reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheEntry {
    pub blink_gen_a_rate: u8,
    pub blink_gen_b_rate: u8,
    pub leds: [u8; 4],
}

impl CacheEntry {
    pub fn from_bytes(bytes: &[u8; ENTRY_SIZE]) -> Self {
        CacheEntry {
            blink_gen_a_rate: bytes[0],
            blink_gen_b_rate: bytes[1],
            leds: [bytes[4], bytes[5], bytes[6], bytes[7]],
        }
    }

    pub fn to_bytes(self) -> [u8; ENTRY_SIZE] {
        let mut bytes = [0u8; ENTRY_SIZE];
        bytes[0] = self.blink_gen_a_rate;
        bytes[1] = self.blink_gen_b_rate;
        bytes[4..8].copy_from_slice(&self.leds);
        bytes
    }

    /// Pick (or assign) the generator holding `rate`.
    pub fn assign_generator(&mut self, rate: u8) -> BlinkGen {
        if self.blink_gen_a_rate == rate {
            BlinkGen::A
        } else if self.blink_gen_b_rate == rate {
            BlinkGen::B
        } else if self.blink_gen_a_rate == 0 {
            self.blink_gen_a_rate = rate;
            BlinkGen::A
        } else if self.blink_gen_b_rate == 0 {
            self.blink_gen_b_rate = rate;
            BlinkGen::B
        } else {
            // both taken by other rates: repurpose B, the locate generator
            // stays stable on A
            self.blink_gen_b_rate = rate;
            BlinkGen::B
        }
    }
}

/// Cache entry index for an ATA port; ports are grouped in 4-drive banks.
pub fn cache_index(ata_port: u32) -> usize {
    (ata_port / 4) as usize
}

/// Drive bay of an ATA port (ports count down from the top of the cage).
pub fn drive_bay(ata_port: u32) -> u8 {
    (8u32.saturating_sub(ata_port)) as u8
}

/// The top half of the bay hangs off the second initiator.
pub fn initiator(bay: u8) -> bool {
    bay > 4
}

/// The flocked shared cache file.
pub struct Cache {
    file: File,
    path: PathBuf,
}

impl Cache {
    /// Open (creating if needed) and exclusively lock the cache.
    pub fn lock(path: &Path) -> Result<Self, Status> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|source| Status::FileOpen {
                path: path.to_path_buf(),
                source,
            })?;
        if file.metadata().map(|m| m.len()).unwrap_or(0) < CACHE_SIZE as u64 {
            file.set_len(CACHE_SIZE as u64)
                .map_err(|source| Status::FileWrite {
                    path: path.to_path_buf(),
                    source,
                })?;
        }
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(Status::FileLock {
                path: path.to_path_buf(),
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(Cache {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn read_entry(&mut self, index: usize) -> Result<CacheEntry, Status> {
        let mut bytes = [0u8; ENTRY_SIZE];
        self.file
            .seek(SeekFrom::Start((index * ENTRY_SIZE) as u64))
            .and_then(|_| self.file.read_exact(&mut bytes))
            .map_err(|source| Status::FileRead {
                path: self.path.clone(),
                source,
            })?;
        Ok(CacheEntry::from_bytes(&bytes))
    }

    pub fn write_entry(&mut self, index: usize, entry: CacheEntry) -> Result<(), Status> {
        self.file
            .seek(SeekFrom::Start((index * ENTRY_SIZE) as u64))
            .and_then(|_| self.file.write_all(&entry.to_bytes()))
            .and_then(|_| self.file.sync_data())
            .map_err(|source| Status::FileWrite {
                path: self.path.clone(),
                source,
            })
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

/// Stage-and-commit one pattern under the cache lock, with the frame
/// writer injected so failures are testable.
///
/// The updated entry hits the cache before the frames go out; any frame
/// failure restores the duplicate taken at the start.
pub fn commit_pattern(
    cache: &mut Cache,
    ata_port: u32,
    pattern: IbpiPattern,
    write_frame: &mut dyn FnMut(&[u8]) -> Result<(), Status>,
) -> Result<(), Status> {
    let index = cache_index(ata_port);
    let saved = cache.read_entry(index)?;
    let mut entry = saved;

    let gen = match blink_rate(pattern) {
        Some(rate) => entry.assign_generator(rate),
        None => BlinkGen::A,
    };
    entry.leds[(ata_port % 4) as usize] = drive_led(pattern, gen);
    cache.write_entry(index, entry)?;

    let bay = drive_bay(ata_port);
    let frames = [
        frame(RegisterType::Amd, &amd_payload(initiator(bay), false)),
        frame(
            RegisterType::Cfg,
            &cfg_payload(entry.blink_gen_a_rate, entry.blink_gen_b_rate),
        ),
        frame(RegisterType::Tx, &tx_payload(entry.leds)),
    ];
    for f in &frames {
        if let Err(err) = write_frame(f) {
            cache.write_entry(index, saved)?;
            return Err(err);
        }
    }
    Ok(())
}

/// Write one pattern to a controller's em_buffer.
pub fn send(
    cntrl_path: &Path,
    cache_path: &Path,
    ata_port: u32,
    previous: Option<IbpiPattern>,
    pattern: IbpiPattern,
) -> Result<bool, Status> {
    if cntrl_path.as_os_str().is_empty() {
        return Err(Status::InvalidPath("empty controller path".to_string()));
    }
    if matches!(pattern, IbpiPattern::Ses(_)) {
        return Err(Status::NotSupported(
            "ses_* patterns need an SES enclosure".to_string(),
        ));
    }
    if previous == Some(pattern) && pattern != IbpiPattern::LocateOff {
        return Ok(false);
    }
    let em_buffer = cntrl_path.join("em_buffer");
    let mut cache = Cache::lock(cache_path)?;
    commit_pattern(&mut cache, ata_port, pattern, &mut |bytes| {
        write_em_buffer(&em_buffer, bytes)
    })?;
    Ok(true)
}

/// Single frame write with the inter-write delay and the EBUSY budget.
fn write_em_buffer(path: &Path, bytes: &[u8]) -> Result<(), Status> {
    let mut attempt = 0;
    loop {
        std::thread::sleep(WRITE_DELAY);
        match std::fs::write(path, bytes) {
            Ok(()) => return Ok(()),
            Err(err) if err.raw_os_error() == Some(libc::EBUSY) && attempt < WRITE_RETRIES => {
                attempt += 1;
            }
            Err(source) => {
                return Err(Status::FileWrite {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_frame_sizes_match_protocol() {
        assert_eq!(header(0, 0).len(), 4);
        assert_eq!(request(RegisterType::Tx, 0, 1).len(), 8);
        assert_eq!(cfg_payload(0, 0).len(), 16);
        assert_eq!(tx_payload([0; 4]).len(), 16);
        assert_eq!(amd_payload(false, false).len(), 12);
    }

    #[test]
    fn test_header_and_request_bytes() {
        assert_eq!(header(16, 24), [0x03, 16, 24, 0]);
        assert_eq!(
            request(RegisterType::Amd, 0, 1),
            [0x40, 0x82, 0xC0, 0, 1, 0, 0, 0]
        );
        assert_eq!(request(RegisterType::Cfg, 0, 1)[2], 0x00);
        assert_eq!(request(RegisterType::Tx, 0, 1)[2], 0x03);
    }

    #[test]
    fn test_cfg_payload_packs_rates_and_policy() {
        let payload = cfg_payload(BLINK_RATE_LOCATE, BLINK_RATE_REBUILD);
        assert_eq!(payload[8], (BLINK_RATE_REBUILD << 4) | BLINK_RATE_LOCATE);
        assert_eq!(payload[9], 0x21); // max_activity_on=2, force_activity_off=1
        assert_eq!(payload[11], 0x01); // sgpio_enable
    }

    #[test]
    fn test_amd_payload_bits() {
        assert_eq!(amd_payload(false, false)[0], 0b1100);
        assert_eq!(amd_payload(true, false)[0], 0b1101);
        assert_eq!(amd_payload(true, true)[0], 0b1111);
    }

    #[test]
    fn test_drive_led_fields() {
        assert_eq!(drive_led(IbpiPattern::Locate, BlinkGen::A), 0b010 << 3);
        assert_eq!(drive_led(IbpiPattern::Locate, BlinkGen::B), 0b011 << 3);
        assert_eq!(drive_led(IbpiPattern::Failure, BlinkGen::A), 0b001 << 5);
        assert_eq!(drive_led(IbpiPattern::Rebuild, BlinkGen::B), 0b011 << 5);
        assert_eq!(drive_led(IbpiPattern::Normal, BlinkGen::A), 0);
        assert_eq!(
            drive_led(IbpiPattern::LocateAndFailure, BlinkGen::A),
            (0b001 << 5) | (0b010 << 3)
        );
    }

    #[test]
    fn test_bay_decoding() {
        assert_eq!(drive_bay(0), 8);
        assert_eq!(drive_bay(7), 1);
        assert!(initiator(8));
        assert!(!initiator(1));
        assert_eq!(cache_index(0), 0);
        assert_eq!(cache_index(3), 0);
        assert_eq!(cache_index(4), 1);
    }

    #[test]
    fn test_generator_assignment_reuses_rates() {
        let mut entry = CacheEntry::default();
        assert_eq!(entry.assign_generator(BLINK_RATE_LOCATE), BlinkGen::A);
        assert_eq!(entry.assign_generator(BLINK_RATE_REBUILD), BlinkGen::B);
        // repeated requests land on the same generator
        assert_eq!(entry.assign_generator(BLINK_RATE_LOCATE), BlinkGen::A);
        assert_eq!(entry.blink_gen_a_rate, BLINK_RATE_LOCATE);
        assert_eq!(entry.blink_gen_b_rate, BLINK_RATE_REBUILD);
    }

    #[test]
    fn test_cache_entry_round_trip() {
        let entry = CacheEntry {
            blink_gen_a_rate: 4,
            blink_gen_b_rate: 2,
            leds: [0x10, 0, 0x20, 0x40],
        };
        assert_eq!(CacheEntry::from_bytes(&entry.to_bytes()), entry);
    }

    #[test]
    fn test_commit_updates_cache_and_emits_three_frames() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("cache");
        let mut cache = Cache::lock(&cache_path).unwrap();
        let mut frames: Vec<Vec<u8>> = Vec::new();
        commit_pattern(&mut cache, 2, IbpiPattern::Locate, &mut |bytes| {
            frames.push(bytes.to_vec());
            Ok(())
        })
        .unwrap();
        assert_eq!(frames.len(), 3);
        // amd, cfg, tx order with the documented sizes
        assert_eq!(frames[0].len(), HEADER_SIZE + REQUEST_SIZE + AMD_SIZE);
        assert_eq!(frames[1].len(), HEADER_SIZE + REQUEST_SIZE + CFG_SIZE);
        assert_eq!(frames[2].len(), HEADER_SIZE + REQUEST_SIZE + TRANSMIT_SIZE);
        let entry = cache.read_entry(0).unwrap();
        assert_eq!(entry.leds[2], drive_led(IbpiPattern::Locate, BlinkGen::A));
        assert_eq!(entry.blink_gen_a_rate, BLINK_RATE_LOCATE);
    }

    #[test]
    fn test_ses_patterns_are_not_supported() {
        use crate::ibpi::SesCode;
        let dir = tempfile::tempdir().unwrap();
        let cntrl = dir.path().join("host");
        std::fs::create_dir_all(&cntrl).unwrap();
        let cache_path = dir.path().join("cache");
        let err = send(
            &cntrl,
            &cache_path,
            0,
            None,
            IbpiPattern::Ses(SesCode::Fault),
        )
        .unwrap_err();
        assert_eq!(err.exit_code(), crate::status::exit_code::NOT_SUPPORTED);
        // rejected before any frame or cache traffic
        assert!(!cache_path.exists());
    }

    #[test]
    fn test_cache_rolls_back_on_frame_failure() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("cache");
        {
            let mut cache = Cache::lock(&cache_path).unwrap();
            commit_pattern(&mut cache, 0, IbpiPattern::Failure, &mut |_| Ok(())).unwrap();
        }
        let before = std::fs::read(&cache_path).unwrap();

        let mut cache = Cache::lock(&cache_path).unwrap();
        let mut calls = 0;
        let result = commit_pattern(&mut cache, 1, IbpiPattern::Locate, &mut |_| {
            calls += 1;
            if calls == 2 {
                Err(Status::FileWrite {
                    path: PathBuf::from("/fake/em_buffer"),
                    source: std::io::Error::from_raw_os_error(libc::EIO),
                })
            } else {
                Ok(())
            }
        });
        assert!(result.is_err());
        drop(cache);
        let after = std::fs::read(&cache_path).unwrap();
        assert_eq!(before, after, "cache must equal its pre-operation content");
    }
}
