//! SES-2 enclosures
//!
//! One [`Enclosure`] per `/sys/class/enclosure` entry, carrying the parsed
//! diagnostic pages and a slot table. Slots reference attached drives by
//! SAS address; block devices store the enclosure index and slot element
//! index back, so no pointer cycles form.

use std::fs::File;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::ibpi::IbpiPattern;
use crate::ses::{self, SesPages};
use crate::sg;
use crate::status::Status;
use crate::sysfs::cntrl;
use crate::utils;

/// One drive slot of an enclosure.
#[derive(Debug, Clone)]
pub struct EnclosureSlot {
    /// Index among the enclosure's device-slot elements; this is the
    /// element addressed by control-page writes.
    pub element_index: usize,
    /// SAS address of the attached drive, when one is present.
    pub sas_address: Option<u64>,
    /// IBPI-equivalent state the hardware currently reports.
    pub ibpi: IbpiPattern,
}

/// An SES-2 enclosure device.
#[derive(Debug, Clone)]
pub struct Enclosure {
    pub sysfs_path: PathBuf,
    /// SCSI generic node used for diagnostic page traffic.
    pub dev_path: PathBuf,
    pub sas_address: u64,
    pub pages: SesPages,
    pub slots: Vec<EnclosureSlot>,
    /// Control page under construction; populated by staged sends, written
    /// and cleared by flush.
    pub(crate) pending: Option<Vec<u8>>,
}

impl Enclosure {
    /// Build an enclosure from already-loaded pages.
    pub fn from_pages(
        sysfs_path: PathBuf,
        dev_path: PathBuf,
        sas_address: u64,
        pages: SesPages,
    ) -> Self {
        let mut enclosure = Enclosure {
            sysfs_path,
            dev_path,
            sas_address,
            pages,
            slots: Vec::new(),
            pending: None,
        };
        enclosure.rebuild_slots();
        enclosure
    }

    /// Discover one enclosure from its sysfs directory, loading pages over
    /// the associated `/dev/sgN` node.
    ///
    /// A missing sg node or a malformed page fails only this enclosure.
    pub fn scan(enclosure_dir: &Path, dev_root: &Path) -> Option<Self> {
        let sysfs_path = utils::canonicalize(enclosure_dir)?;
        let sg_name = utils::list_dir(&enclosure_dir.join("device/scsi_generic"))
            .first()
            .map(|p| utils::basename(p))?;
        let dev_path = dev_root.join(sg_name);
        let sas_address = cntrl::sas_address(&sysfs_path).unwrap_or(0);

        let file = match File::open(&dev_path) {
            Ok(f) => f,
            Err(err) => {
                warn!("cannot open '{}': {}", dev_path.display(), err);
                return None;
            }
        };
        let pages = match Self::load_pages(&file, &dev_path) {
            Ok(p) => p,
            Err(err) => {
                warn!("enclosure '{}': {}", sysfs_path.display(), err);
                return None;
            }
        };
        Some(Self::from_pages(sysfs_path, dev_path, sas_address, pages))
    }

    fn load_pages(file: &File, dev_path: &Path) -> Result<SesPages, Status> {
        let page1 = sg::receive_diagnostic(file, dev_path, ses::PAGE_CONFIGURATION)?;
        let page2 = sg::receive_diagnostic(file, dev_path, ses::PAGE_ENCLOSURE_STATUS)?;
        // the additional page only contributes SAS addresses; not every
        // enclosure implements it
        let page_a =
            sg::receive_diagnostic(file, dev_path, ses::PAGE_ADDITIONAL_ELEMENT_STATUS).ok();
        SesPages::parse(page1, page2, page_a.as_deref())
    }

    /// Recompute the slot table from the cached pages.
    pub fn rebuild_slots(&mut self) {
        self.slots = (0..self.pages.slot_count())
            .map(|element_index| EnclosureSlot {
                element_index,
                sas_address: self.pages.slot_sas_address(element_index),
                ibpi: self.pages.slot_pattern(element_index),
            })
            .collect();
    }

    /// Slot holding the drive with the given SAS address.
    pub fn slot_by_sas(&self, sas_address: u64) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.sas_address == Some(sas_address))
    }
}
