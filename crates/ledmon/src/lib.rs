//! Enclosure LED management
//!
//! This library backs two binaries:
//! - `ledmon`, a daemon that watches software-RAID block devices and
//!   drives enclosure LEDs to match their state
//! - `ledctl`, a one-shot utility that sets LED patterns on named
//!   devices or slots
//!
//! The shared core: sysfs inventory, the RAID model, the IBPI pattern
//! algebra and one transport encoder per backplane technology.

pub mod config;
pub mod events;
pub mod ibpi;
pub mod monitor;
pub mod pidfile;
pub mod raid;
pub mod ses;
pub mod sg;
pub mod shm;
pub mod slots;
pub mod status;
pub mod sysfs;
pub mod transport;
pub mod utils;
