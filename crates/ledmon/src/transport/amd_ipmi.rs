//! AMD IPMI transport
//!
//! LEDs sit behind an MG9098 backplane controller on an SMBus reached
//! through the BMC: every operation is an IPMI Master Write-Read
//! (NetFN 0x06, CMD 0x52) that reads or writes one MG9098 register. Each
//! state register holds one bit per drive bay.

use std::fs::File;
use std::os::fd::{AsFd, AsRawFd};
use std::path::Path;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::warn;

use crate::ibpi::IbpiPattern;
use crate::status::Status;
use crate::sysfs::AmdPlatform;

pub const NETFN_APP: u8 = 0x06;
pub const CMD_MASTER_WRITE_READ: u8 = 0x52;

/// MG9098 registers.
pub const REG_PFA: u8 = 0x41;
pub const REG_LOCATE: u8 = 0x42;
pub const REG_FAILURE: u8 = 0x44;
pub const REG_FAILED_ARRAY: u8 = 0x45;
pub const REG_REBUILD: u8 = 0x46;
pub const REG_HOTSPARE: u8 = 0x47;
pub const REG_SMBUS_CONTROL: u8 = 0x3C;
pub const REG_CHIP_ID: u8 = 0x63;
/// Decimal 98: the MG9098 answers its own name.
pub const CHIP_ID_MG9098: u8 = 98;

/// Registers cleared when a drive returns to normal.
const STATE_CLEAR_REGISTERS: [u8; 5] =
    [REG_PFA, REG_LOCATE, REG_FAILURE, REG_FAILED_ARRAY, REG_REBUILD];

/// IPMI channel of the backplane SMBus, per platform.
pub fn channel(platform: AmdPlatform) -> Result<u8, Status> {
    match platform {
        AmdPlatform::EthanolX => Ok(0x0D),
        AmdPlatform::DaytonaX => Ok(0x17),
        other => Err(Status::NotSupported(format!(
            "no IPMI backplane on platform {other:?}"
        ))),
    }
}

/// MG9098 slave address for a drive bay.
///
/// Daytona-X splits bays across three controllers: 1-8, 9-16 and 17 up.
pub fn slave_address(platform: AmdPlatform, drive_bay: u8) -> Result<u8, Status> {
    match platform {
        AmdPlatform::EthanolX => Ok(0xC0),
        AmdPlatform::DaytonaX => Ok(match (drive_bay.saturating_sub(1)) / 8 {
            0 => 0xC0,
            1 => 0xC2,
            _ => 0xC4,
        }),
        other => Err(Status::NotSupported(format!(
            "no IPMI backplane on platform {other:?}"
        ))),
    }
}

/// Bit a drive bay occupies within its controller's registers.
pub fn bay_bit(drive_bay: u8) -> u8 {
    1 << ((drive_bay.saturating_sub(1)) % 8)
}

/// Master Write-Read payload reading one register.
pub fn read_request(channel: u8, slave_addr: u8, reg: u8) -> [u8; 4] {
    [channel, slave_addr, 1, reg]
}

/// Master Write-Read payload writing one register.
pub fn write_request(channel: u8, slave_addr: u8, reg: u8, value: u8) -> [u8; 5] {
    [channel, slave_addr, 0, reg, value]
}

/// State register a pattern maps to, `None` for the quiet patterns.
pub fn pattern_register(pattern: IbpiPattern) -> Option<u8> {
    match pattern {
        IbpiPattern::Pfa => Some(REG_PFA),
        IbpiPattern::Locate => Some(REG_LOCATE),
        IbpiPattern::Failure | IbpiPattern::LocateAndFailure => Some(REG_FAILURE),
        IbpiPattern::FailedArray => Some(REG_FAILED_ARRAY),
        IbpiPattern::Rebuild => Some(REG_REBUILD),
        IbpiPattern::Hotspare => Some(REG_HOTSPARE),
        _ => None,
    }
}

/// One IPMI request/response exchange.
///
/// The seam between the register logic and the `/dev/ipmi0` ioctl
/// plumbing; tests substitute a fake register bank.
pub trait IpmiTransact {
    fn transact(&mut self, netfn: u8, cmd: u8, payload: &[u8]) -> Result<Vec<u8>, Status>;
}

fn read_register(
    dev: &mut dyn IpmiTransact,
    channel: u8,
    addr: u8,
    reg: u8,
) -> Result<u8, Status> {
    let answer = dev.transact(
        NETFN_APP,
        CMD_MASTER_WRITE_READ,
        &read_request(channel, addr, reg),
    )?;
    answer.first().copied().ok_or_else(|| {
        Status::DataError(format!("empty master write-read answer for reg {reg:#04x}"))
    })
}

fn write_register(
    dev: &mut dyn IpmiTransact,
    channel: u8,
    addr: u8,
    reg: u8,
    value: u8,
) -> Result<(), Status> {
    dev.transact(
        NETFN_APP,
        CMD_MASTER_WRITE_READ,
        &write_request(channel, addr, reg, value),
    )?;
    Ok(())
}

/// Confirm an MG9098 is present behind the platform's SMBus.
pub fn verify_backplane(
    dev: &mut dyn IpmiTransact,
    platform: AmdPlatform,
    drive_bay: u8,
) -> Result<(), Status> {
    let channel = channel(platform)?;
    let addr = slave_address(platform, drive_bay)?;
    let id = read_register(dev, channel, addr, REG_CHIP_ID)?;
    if id != CHIP_ID_MG9098 {
        return Err(Status::InvalidController(format!(
            "chip id register answered {id}, expected {CHIP_ID_MG9098}"
        )));
    }
    Ok(())
}

/// Apply a pattern to one drive bay.
pub fn set_pattern(
    dev: &mut dyn IpmiTransact,
    platform: AmdPlatform,
    drive_bay: u8,
    previous: Option<IbpiPattern>,
    pattern: IbpiPattern,
) -> Result<bool, Status> {
    let channel = channel(platform)?;
    let addr = slave_address(platform, drive_bay)?;
    let bit = bay_bit(drive_bay);

    match pattern.effective() {
        IbpiPattern::Normal => {
            // returning to normal wipes every state the bay may hold
            for reg in STATE_CLEAR_REGISTERS {
                let value = read_register(dev, channel, addr, reg)?;
                if value & bit != 0 {
                    write_register(dev, channel, addr, reg, value & !bit)?;
                }
            }
            Ok(true)
        }
        IbpiPattern::LocateOff => {
            let value = read_register(dev, channel, addr, REG_LOCATE)?;
            if value & bit == 0 {
                warn!("bay {drive_bay}: locate already off");
                return Ok(false);
            }
            write_register(dev, channel, addr, REG_LOCATE, value & !bit)?;
            Ok(true)
        }
        IbpiPattern::Ses(_) => Err(Status::NotSupported(
            "ses_* patterns need an SES enclosure".to_string(),
        )),
        effective => {
            if previous == Some(pattern) {
                return Ok(false);
            }
            let Some(reg) = pattern_register(effective) else {
                return Err(Status::OutOfRange(effective.to_string()));
            };
            // the MG9098 ignores state writes until SMBus control is taken
            write_register(dev, channel, addr, REG_SMBUS_CONTROL, 0x01)?;
            let value = read_register(dev, channel, addr, reg)?;
            write_register(dev, channel, addr, reg, value | bit)?;
            Ok(true)
        }
    }
}

const IPMI_SYSTEM_INTERFACE_ADDR_TYPE: i32 = 0x0C;
const IPMI_BMC_CHANNEL: i16 = 0x0F;
const IPMI_RESPONSE_TIMEOUT_MS: u16 = 1000;

#[repr(C)]
struct IpmiSystemInterfaceAddr {
    addr_type: i32,
    channel: i16,
    lun: u8,
}

#[repr(C)]
struct IpmiMsg {
    netfn: u8,
    cmd: u8,
    data_len: u16,
    data: *mut u8,
}

#[repr(C)]
struct IpmiReq {
    addr: *mut u8,
    addr_len: u32,
    msgid: libc::c_long,
    msg: IpmiMsg,
}

#[repr(C)]
struct IpmiRecv {
    recv_type: i32,
    addr: *mut u8,
    addr_len: u32,
    msgid: libc::c_long,
    msg: IpmiMsg,
}

/// `/dev/ipmi0` message interface.
pub struct IpmiDevice {
    file: File,
    msgid: libc::c_long,
}

impl IpmiDevice {
    pub fn open(path: &Path) -> Result<Self, Status> {
        let file = File::options()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| Status::FileOpen {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(IpmiDevice { file, msgid: 1 })
    }
}

impl IpmiTransact for IpmiDevice {
    fn transact(&mut self, netfn: u8, cmd: u8, payload: &[u8]) -> Result<Vec<u8>, Status> {
        let send_code = nix::request_code_read!(b'i', 13, std::mem::size_of::<IpmiReq>());
        let recv_code = nix::request_code_readwrite!(b'i', 11, std::mem::size_of::<IpmiRecv>());

        let mut addr = IpmiSystemInterfaceAddr {
            addr_type: IPMI_SYSTEM_INTERFACE_ADDR_TYPE,
            channel: IPMI_BMC_CHANNEL,
            lun: 0,
        };
        let mut data = payload.to_vec();
        self.msgid += 1;
        let mut req = IpmiReq {
            addr: (&mut addr as *mut IpmiSystemInterfaceAddr).cast(),
            addr_len: std::mem::size_of::<IpmiSystemInterfaceAddr>() as u32,
            msgid: self.msgid,
            msg: IpmiMsg {
                netfn,
                cmd,
                data_len: data.len() as u16,
                data: data.as_mut_ptr(),
            },
        };
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), send_code, &mut req) };
        if rc < 0 {
            return Err(Status::FileWrite {
                path: "/dev/ipmi0".into(),
                source: std::io::Error::last_os_error(),
            });
        }

        let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
        let ready = poll(&mut fds, PollTimeout::from(IPMI_RESPONSE_TIMEOUT_MS))
            .map_err(|errno| Status::FileRead {
                path: "/dev/ipmi0".into(),
                source: std::io::Error::from_raw_os_error(errno as i32),
            })?;
        if ready == 0 {
            return Err(Status::DataError(
                "timed out waiting for BMC response".to_string(),
            ));
        }

        let mut recv_addr = IpmiSystemInterfaceAddr {
            addr_type: 0,
            channel: 0,
            lun: 0,
        };
        let mut answer = vec![0u8; 64];
        let mut recv = IpmiRecv {
            recv_type: 0,
            addr: (&mut recv_addr as *mut IpmiSystemInterfaceAddr).cast(),
            addr_len: std::mem::size_of::<IpmiSystemInterfaceAddr>() as u32,
            msgid: 0,
            msg: IpmiMsg {
                netfn: 0,
                cmd: 0,
                data_len: answer.len() as u16,
                data: answer.as_mut_ptr(),
            },
        };
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), recv_code, &mut recv) };
        if rc < 0 {
            return Err(Status::FileRead {
                path: "/dev/ipmi0".into(),
                source: std::io::Error::last_os_error(),
            });
        }
        answer.truncate(recv.msg.data_len as usize);
        // first byte is the completion code
        match answer.split_first() {
            Some((&0, rest)) => Ok(rest.to_vec()),
            Some((&code, _)) => Err(Status::DataError(format!(
                "BMC returned completion code {code:#04x}"
            ))),
            None => Err(Status::DataError("empty BMC response".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Fake MG9098: a register bank that records every exchange.
    struct FakeBackplane {
        registers: HashMap<u8, u8>,
        log: Vec<Vec<u8>>,
    }

    impl FakeBackplane {
        fn new() -> Self {
            let mut registers = HashMap::new();
            registers.insert(REG_CHIP_ID, CHIP_ID_MG9098);
            FakeBackplane {
                registers,
                log: Vec::new(),
            }
        }
    }

    impl IpmiTransact for FakeBackplane {
        fn transact(&mut self, netfn: u8, cmd: u8, payload: &[u8]) -> Result<Vec<u8>, Status> {
            assert_eq!(netfn, NETFN_APP);
            assert_eq!(cmd, CMD_MASTER_WRITE_READ);
            self.log.push(payload.to_vec());
            match payload {
                [_ch, _addr, 1, reg] => {
                    Ok(vec![self.registers.get(reg).copied().unwrap_or(0)])
                }
                [_ch, _addr, 0, reg, value] => {
                    self.registers.insert(*reg, *value);
                    Ok(vec![])
                }
                other => panic!("unexpected payload {other:?}"),
            }
        }
    }

    #[test]
    fn test_platform_tables() {
        assert_eq!(channel(AmdPlatform::EthanolX).unwrap(), 0x0D);
        assert_eq!(channel(AmdPlatform::DaytonaX).unwrap(), 0x17);
        assert!(channel(AmdPlatform::None).is_err());
        assert_eq!(slave_address(AmdPlatform::EthanolX, 12).unwrap(), 0xC0);
        assert_eq!(slave_address(AmdPlatform::DaytonaX, 3).unwrap(), 0xC0);
        assert_eq!(slave_address(AmdPlatform::DaytonaX, 9).unwrap(), 0xC2);
        assert_eq!(slave_address(AmdPlatform::DaytonaX, 21).unwrap(), 0xC4);
    }

    #[test]
    fn test_bay_bit_wraps_per_controller() {
        assert_eq!(bay_bit(1), 0x01);
        assert_eq!(bay_bit(8), 0x80);
        assert_eq!(bay_bit(9), 0x01);
        // bay 21 lands on bit 4 of the third controller
        assert_eq!(bay_bit(21), 0x10);
    }

    #[test]
    fn test_request_payload_shapes() {
        assert_eq!(read_request(0x17, 0xC4, REG_LOCATE), [0x17, 0xC4, 1, 0x42]);
        assert_eq!(
            write_request(0x17, 0xC4, REG_LOCATE, 0x10),
            [0x17, 0xC4, 0, 0x42, 0x10]
        );
    }

    #[test]
    fn test_locate_enables_smbus_then_sets_bit() {
        let mut bp = FakeBackplane::new();
        let wrote =
            set_pattern(&mut bp, AmdPlatform::DaytonaX, 21, None, IbpiPattern::Locate).unwrap();
        assert!(wrote);
        assert_eq!(bp.registers.get(&REG_SMBUS_CONTROL), Some(&0x01));
        assert_eq!(bp.registers.get(&REG_LOCATE), Some(&0x10));
        // smbus enable first, then read-modify-write of the locate register
        assert_eq!(bp.log[0], write_request(0x17, 0xC4, REG_SMBUS_CONTROL, 0x01));
        assert_eq!(bp.log[1], read_request(0x17, 0xC4, REG_LOCATE));
        assert_eq!(bp.log[2], write_request(0x17, 0xC4, REG_LOCATE, 0x10));
    }

    #[test]
    fn test_normal_clears_all_state_registers() {
        let mut bp = FakeBackplane::new();
        let bit = bay_bit(3);
        for reg in STATE_CLEAR_REGISTERS {
            bp.registers.insert(reg, bit | 0x80);
        }
        set_pattern(&mut bp, AmdPlatform::EthanolX, 3, None, IbpiPattern::Normal).unwrap();
        for reg in STATE_CLEAR_REGISTERS {
            assert_eq!(bp.registers.get(&reg), Some(&0x80), "reg {reg:#04x}");
        }
    }

    #[test]
    fn test_locate_off_clears_only_locate() {
        let mut bp = FakeBackplane::new();
        let bit = bay_bit(5);
        bp.registers.insert(REG_LOCATE, bit);
        bp.registers.insert(REG_FAILURE, bit);
        let wrote = set_pattern(
            &mut bp,
            AmdPlatform::EthanolX,
            5,
            None,
            IbpiPattern::LocateOff,
        )
        .unwrap();
        assert!(wrote);
        assert_eq!(bp.registers.get(&REG_LOCATE), Some(&0));
        assert_eq!(bp.registers.get(&REG_FAILURE), Some(&bit));
    }

    #[test]
    fn test_locate_off_warns_when_already_clear() {
        let mut bp = FakeBackplane::new();
        let wrote = set_pattern(
            &mut bp,
            AmdPlatform::EthanolX,
            5,
            None,
            IbpiPattern::LocateOff,
        )
        .unwrap();
        assert!(!wrote);
    }

    #[test]
    fn test_backplane_verification() {
        let mut bp = FakeBackplane::new();
        verify_backplane(&mut bp, AmdPlatform::EthanolX, 1).unwrap();
        bp.registers.insert(REG_CHIP_ID, 0x55);
        assert!(verify_backplane(&mut bp, AmdPlatform::EthanolX, 1).is_err());
    }

    #[test]
    fn test_equal_pattern_skipped() {
        let mut bp = FakeBackplane::new();
        let wrote = set_pattern(
            &mut bp,
            AmdPlatform::EthanolX,
            2,
            Some(IbpiPattern::Rebuild),
            IbpiPattern::Rebuild,
        )
        .unwrap();
        assert!(!wrote);
        assert!(bp.log.is_empty());
    }
}
