//! Shared configuration bridge
//!
//! The daemon publishes its effective configuration to a named POSIX
//! shared-memory object so the control utility works with the same
//! settings without re-parsing the configuration file. The object is
//! plain `KEY=VALUE` text, truncated and rewritten on each publish;
//! single writer (the daemon), readers open it as an ordinary file under
//! `/dev/shm`.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use tracing::debug;

use crate::config::LedConf;
use crate::status::Status;

/// Name of the shared-memory object.
pub const BRIDGE_NAME: &str = "/ledmon.conf";
/// Where the object is visible as a file.
pub const BRIDGE_DEV_PATH: &str = "/dev/shm/ledmon.conf";

/// Publish the effective configuration under `name`.
pub fn publish(name: &str, conf: &LedConf) -> Result<(), Status> {
    let fd = shm_open(
        name,
        OFlag::O_CREAT | OFlag::O_RDWR,
        Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IROTH,
    )
    .map_err(|errno| Status::FileOpen {
        path: name.into(),
        source: std::io::Error::from_raw_os_error(errno as i32),
    })?;
    let mut file = File::from(fd);
    file.set_len(0)
        .and_then(|_| file.write_all(conf.to_bridge_text().as_bytes()))
        .map_err(|source| Status::FileWrite {
            path: name.into(),
            source,
        })?;
    debug!("configuration published to shm object '{name}'");
    Ok(())
}

/// Drop the object, normally at daemon shutdown.
pub fn unpublish(name: &str) {
    let _ = shm_unlink(name);
}

/// Read a bridge object (or any configuration file) if present.
pub fn load(path: &Path) -> Option<LedConf> {
    let text = std::fs::read_to_string(path).ok()?;
    match LedConf::parse(&text) {
        Ok(conf) => Some(conf),
        Err(err) => {
            debug!("bridge at '{}' is unreadable: {}", path.display(), err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_publish_and_load_round_trip() {
        let name = format!("/ledmon-test-{}.conf", std::process::id());
        let mut conf = LedConf::default();
        conf.interval = 30;
        conf.raid_members_only = true;
        publish(&name, &conf).unwrap();

        let path = PathBuf::from(format!("/dev/shm{name}"));
        let loaded = load(&path).expect("bridge readable");
        assert_eq!(loaded.interval, 30);
        assert!(loaded.raid_members_only);

        unpublish(&name);
        assert!(load(&path).is_none());
    }

    #[test]
    fn test_publish_truncates_previous_content() {
        let name = format!("/ledmon-test-trunc-{}.conf", std::process::id());
        let mut long = LedConf::default();
        long.allowlist = vec!["/sys/devices/pci0000:00/0000:00:17.0".to_string(); 4];
        publish(&name, &long).unwrap();
        publish(&name, &LedConf::default()).unwrap();

        let path = PathBuf::from(format!("/dev/shm{name}"));
        let loaded = load(&path).expect("bridge readable");
        assert!(loaded.allowlist.is_empty());
        unpublish(&name);
    }
}
