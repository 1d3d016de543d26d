//! SCSI generic (sg) pass-through for SES diagnostic pages
//!
//! Two CDBs are enough for the LED path: RECEIVE DIAGNOSTIC RESULTS to
//! read a page and SEND DIAGNOSTIC to write the control page back. Both
//! go through the `SG_IO` ioctl on `/dev/sgN`.

use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::Path;

use crate::status::Status;

const SG_IO: libc::c_ulong = 0x2285;
const SG_DXFER_TO_DEV: i32 = -2;
const SG_DXFER_FROM_DEV: i32 = -3;
const SG_INTERFACE_ID: i32 = 'S' as i32;

/// Transfer timeout in milliseconds.
const SG_TIMEOUT_MS: u32 = 30_000;
/// Allocation length for page reads; SES pages are well below this.
const RECV_BUFFER_LEN: usize = 32 * 1024;

const CDB_RECEIVE_DIAGNOSTIC: u8 = 0x1C;
const CDB_SEND_DIAGNOSTIC: u8 = 0x1D;
/// Page code valid bit of RECEIVE DIAGNOSTIC RESULTS.
const RECEIVE_PCV: u8 = 0x01;
/// Page format bit of SEND DIAGNOSTIC.
const SEND_PF: u8 = 0x10;

/// `struct sg_io_hdr` from `<scsi/sg.h>`.
#[repr(C)]
struct SgIoHdr {
    interface_id: i32,
    dxfer_direction: i32,
    cmd_len: u8,
    mx_sb_len: u8,
    iovec_count: u16,
    dxfer_len: u32,
    dxferp: *mut libc::c_void,
    cmdp: *mut u8,
    sbp: *mut u8,
    timeout: u32,
    flags: u32,
    pack_id: i32,
    usr_ptr: *mut libc::c_void,
    status: u8,
    masked_status: u8,
    msg_status: u8,
    sb_len_wr: u8,
    host_status: u16,
    driver_status: u16,
    resid: i32,
    duration: u32,
    info: u32,
}

fn sg_transfer(
    file: &File,
    path: &Path,
    cdb: &mut [u8],
    direction: i32,
    buffer: &mut [u8],
) -> Result<(), Status> {
    let mut sense = [0u8; 32];
    let mut hdr = SgIoHdr {
        interface_id: SG_INTERFACE_ID,
        dxfer_direction: direction,
        cmd_len: cdb.len() as u8,
        mx_sb_len: sense.len() as u8,
        iovec_count: 0,
        dxfer_len: buffer.len() as u32,
        dxferp: buffer.as_mut_ptr().cast(),
        cmdp: cdb.as_mut_ptr(),
        sbp: sense.as_mut_ptr(),
        timeout: SG_TIMEOUT_MS,
        flags: 0,
        pack_id: 0,
        usr_ptr: std::ptr::null_mut(),
        status: 0,
        masked_status: 0,
        msg_status: 0,
        sb_len_wr: 0,
        host_status: 0,
        driver_status: 0,
        resid: 0,
        duration: 0,
        info: 0,
    };
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), SG_IO, &mut hdr) };
    if rc < 0 {
        let source = std::io::Error::last_os_error();
        return match direction {
            SG_DXFER_TO_DEV => Err(Status::FileWrite {
                path: path.to_path_buf(),
                source,
            }),
            _ => Err(Status::FileRead {
                path: path.to_path_buf(),
                source,
            }),
        };
    }
    if hdr.status != 0 || hdr.host_status != 0 || hdr.driver_status != 0 {
        return Err(Status::DataError(format!(
            "sg transfer on {} failed: status={:#x} host={:#x} driver={:#x}",
            path.display(),
            hdr.status,
            hdr.host_status,
            hdr.driver_status
        )));
    }
    Ok(())
}

/// Read one diagnostic page.
pub fn receive_diagnostic(file: &File, path: &Path, page_code: u8) -> Result<Vec<u8>, Status> {
    let mut buffer = vec![0u8; RECV_BUFFER_LEN];
    let len = buffer.len() as u16;
    let mut cdb = [
        CDB_RECEIVE_DIAGNOSTIC,
        RECEIVE_PCV,
        page_code,
        (len >> 8) as u8,
        (len & 0xFF) as u8,
        0,
    ];
    sg_transfer(file, path, &mut cdb, SG_DXFER_FROM_DEV, &mut buffer)?;
    if buffer[0] != page_code {
        return Err(Status::DataError(format!(
            "requested page {:#04x} from {}, device returned {:#04x}",
            page_code,
            path.display(),
            buffer[0]
        )));
    }
    let page_len = u16::from_be_bytes([buffer[2], buffer[3]]) as usize + 4;
    buffer.truncate(page_len.min(RECV_BUFFER_LEN));
    Ok(buffer)
}

/// Write a control page in a single SEND DIAGNOSTIC transaction.
pub fn send_diagnostic(file: &File, path: &Path, page: &[u8]) -> Result<(), Status> {
    let mut buffer = page.to_vec();
    let len = buffer.len() as u16;
    let mut cdb = [
        CDB_SEND_DIAGNOSTIC,
        SEND_PF,
        0,
        (len >> 8) as u8,
        (len & 0xFF) as u8,
        0,
    ];
    sg_transfer(file, path, &mut cdb, SG_DXFER_TO_DEV, &mut buffer)
}
