//! Event loop
//!
//! Single-threaded, cooperative: one tick is one full scan-and-dispatch
//! pass, run on the current-thread runtime. Between ticks the loop sleeps
//! until the scan interval elapses, a block-disk uevent arrives on the
//! kobject netlink socket, or `/proc/mdstat` raises its exception
//! condition. SIGTERM ends the loop at the next wake-up; an in-flight
//! transport write is never interrupted.

use std::fs::File;
use std::io::Read;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::socket::{
    bind, recv, socket, AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol, SockType,
};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info, warn};

use crate::monitor::{Monitor, UdevAction};
use crate::status::Status;

/// Netlink multicast group the kernel broadcasts uevents on.
const UEVENT_GROUP: u32 = 1;
const UEVENT_BUFFER_LEN: usize = 8 * 1024;

/// One parsed kobject uevent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdevEvent {
    pub action: UdevAction,
    pub devpath: PathBuf,
    pub subsystem: String,
    pub devtype: String,
}

impl UdevEvent {
    /// True for the events the monitor cares about: whole disks of the
    /// block subsystem.
    pub fn is_disk_event(&self) -> bool {
        self.subsystem == "block" && self.devtype == "disk"
    }
}

/// Parse one uevent datagram: `action@devpath` followed by
/// NUL-separated `KEY=VALUE` properties.
pub fn parse_uevent(buffer: &[u8]) -> Option<UdevEvent> {
    let mut fields = buffer.split(|b| *b == 0).filter(|f| !f.is_empty());
    let header = std::str::from_utf8(fields.next()?).ok()?;
    let (action_text, devpath) = header.split_once('@')?;
    let action = match action_text {
        "add" => UdevAction::Add,
        "remove" => UdevAction::Remove,
        _ => return None,
    };
    let mut subsystem = String::new();
    let mut devtype = String::new();
    for field in fields {
        let Ok(text) = std::str::from_utf8(field) else {
            continue;
        };
        if let Some(value) = text.strip_prefix("SUBSYSTEM=") {
            subsystem = value.to_string();
        } else if let Some(value) = text.strip_prefix("DEVTYPE=") {
            devtype = value.to_string();
        }
    }
    Some(UdevEvent {
        action,
        devpath: PathBuf::from(devpath),
        subsystem,
        devtype,
    })
}

/// Kobject-uevent netlink listener.
pub struct UdevMonitor {
    fd: OwnedFd,
}

impl UdevMonitor {
    pub fn open() -> Result<Self, Status> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            SockProtocol::NetlinkKObjectUEvent,
        )
        .map_err(|errno| Status::FileOpen {
            path: PathBuf::from("netlink:kobject-uevent"),
            source: std::io::Error::from_raw_os_error(errno as i32),
        })?;
        let addr = NetlinkAddr::new(std::process::id(), UEVENT_GROUP);
        bind(fd.as_raw_fd(), &addr).map_err(|errno| Status::FileOpen {
            path: PathBuf::from("netlink:kobject-uevent"),
            source: std::io::Error::from_raw_os_error(errno as i32),
        })?;
        Ok(UdevMonitor { fd })
    }

    /// Read every queued event without blocking.
    pub fn drain(&self) -> Vec<UdevEvent> {
        let mut events = Vec::new();
        let mut buffer = [0u8; UEVENT_BUFFER_LEN];
        loop {
            match recv(self.fd.as_raw_fd(), &mut buffer, MsgFlags::MSG_DONTWAIT) {
                Ok(0) => break,
                Ok(len) => {
                    if let Some(event) = parse_uevent(&buffer[..len]) {
                        events.push(event);
                    }
                }
                Err(_) => break,
            }
        }
        events
    }
}

impl AsRawFd for UdevMonitor {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.fd.as_raw_fd()
    }
}

/// `/proc/mdstat` exception watcher.
///
/// md signals array state changes through the error/priority band; the
/// file is re-read after every wake-up to rearm the condition.
pub struct MdstatWatcher {
    fd: AsyncFd<File>,
}

impl MdstatWatcher {
    pub fn open(path: &Path) -> Option<Self> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(err) => {
                debug!("cannot open '{}': {}", path.display(), err);
                return None;
            }
        };
        match AsyncFd::with_interest(file, Interest::PRIORITY | Interest::ERROR) {
            Ok(fd) => Some(MdstatWatcher { fd }),
            Err(err) => {
                warn!(
                    "cannot watch '{}' ({}); waking on timer and udev only",
                    path.display(),
                    err
                );
                None
            }
        }
    }

    /// Wait for the exception condition and rearm it.
    pub async fn changed(&mut self) {
        if let Ok(mut guard) = self.fd.ready(Interest::PRIORITY | Interest::ERROR).await {
            guard.clear_ready();
        }
        let mut discard = String::new();
        let _ = self.fd.get_mut().read_to_string(&mut discard);
    }
}

/// Daemon main loop; returns when SIGTERM arrives.
pub async fn run(monitor: &mut Monitor, sysfs_root: &Path) -> Result<(), Status> {
    let mut sigterm = signal(SignalKind::terminate()).map_err(|source| Status::FileOpen {
        path: PathBuf::from("signal:SIGTERM"),
        source,
    })?;

    let udev = match UdevMonitor::open() {
        Ok(socket) => match AsyncFd::with_interest(socket, Interest::READABLE) {
            Ok(fd) => Some(fd),
            Err(err) => {
                warn!("cannot register uevent socket: {err}");
                None
            }
        },
        Err(err) => {
            warn!("cannot listen for uevents: {err}");
            None
        }
    };
    let mut mdstat = MdstatWatcher::open(Path::new("/proc/mdstat"));

    info!("monitor started, interval {}s", monitor.conf.interval);
    loop {
        monitor.tick();

        let sleep = tokio::time::sleep(Duration::from_secs(monitor.conf.interval));
        tokio::pin!(sleep);
        tokio::select! {
            _ = &mut sleep => {}
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down");
                return Ok(());
            }
            guard = async { udev.as_ref().expect("guarded by condition").readable().await },
                if udev.is_some() =>
            {
                if let (Some(fd), Ok(mut guard)) = (udev.as_ref(), guard) {
                    for event in fd.get_ref().drain() {
                        if !event.is_disk_event() {
                            continue;
                        }
                        debug!("uevent {:?} for '{}'", event.action, event.devpath.display());
                        let full = sysfs_root.join(
                            event.devpath.strip_prefix("/").unwrap_or(&event.devpath),
                        );
                        monitor.handle_udev(event.action, &full);
                    }
                    guard.clear_ready();
                }
            }
            _ = async { mdstat.as_mut().expect("guarded by condition").changed().await },
                if mdstat.is_some() =>
            {
                debug!("mdstat raised an exception condition");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datagram(parts: &[&str]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for part in parts {
            bytes.extend_from_slice(part.as_bytes());
            bytes.push(0);
        }
        bytes
    }

    #[test]
    fn test_parse_add_event() {
        let buffer = datagram(&[
            "add@/devices/pci0000:00/0000:00:17.0/ata1/host0/target0:0:0/0:0:0:0/block/sda",
            "ACTION=add",
            "DEVPATH=/devices/pci0000:00/0000:00:17.0/ata1/host0/target0:0:0/0:0:0:0/block/sda",
            "SUBSYSTEM=block",
            "DEVTYPE=disk",
        ]);
        let event = parse_uevent(&buffer).unwrap();
        assert_eq!(event.action, UdevAction::Add);
        assert!(event.is_disk_event());
        assert!(event.devpath.ends_with("block/sda"));
    }

    #[test]
    fn test_partition_events_are_filtered() {
        let buffer = datagram(&[
            "add@/devices/.../block/sda/sda1",
            "SUBSYSTEM=block",
            "DEVTYPE=partition",
        ]);
        let event = parse_uevent(&buffer).unwrap();
        assert!(!event.is_disk_event());
    }

    #[test]
    fn test_change_events_are_ignored() {
        let buffer = datagram(&["change@/devices/.../block/sda", "SUBSYSTEM=block"]);
        assert!(parse_uevent(&buffer).is_none());
    }

    #[test]
    fn test_malformed_datagram_is_ignored() {
        assert!(parse_uevent(b"libudev\0junk").is_none());
        assert!(parse_uevent(b"").is_none());
    }
}
