//! IBPI pattern vocabulary and transition algebra
//!
//! The pattern set is the stable external vocabulary: names accepted on the
//! `ledctl` command line, mirrored into log lines, and fed to the transport
//! encoders. Two operations work on patterns:
//!
//! * [`IbpiPattern::accumulate`] combines several suggestions made for the
//!   same device within one scan (a device can be a member of more than one
//!   array mid-reshape); the higher-priority pattern wins.
//! * [`merge`] carries a device's pattern across scans, applying the
//!   transition rules for hot-plug arrivals and removals.

use std::fmt;
use std::str::FromStr;

use crate::status::Status;

/// LED pattern in the In-Band Power Interface vocabulary.
///
/// `Unknown` marks a device whose state has not been observed yet; it is
/// emitted as `Normal`. `Added` and `Removed` are transient markers set by
/// udev events and never emitted directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IbpiPattern {
    Unknown,
    Normal,
    OneshotNormal,
    Degraded,
    Hotspare,
    Rebuild,
    FailedArray,
    Pfa,
    Failure,
    Locate,
    LocateOff,
    LocateAndFailure,
    Added,
    Removed,
    /// SES-2 direct control code, valid only behind a SCSI-SES controller.
    Ses(SesCode),
}

/// Direct SES-2 control-element requests exposed as `ses_*` CLI names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SesCode {
    Abort,
    Rebuild,
    Ifa,
    Ica,
    ConsCheck,
    Hotspare,
    RsvdDev,
    Ok,
    Ident,
    Rm,
    Insert,
    Missing,
    Dnr,
    Active,
    EnableBb,
    EnableBa,
    Devoff,
    Fault,
    Prdfail,
}

impl SesCode {
    pub const ALL: [SesCode; 19] = [
        SesCode::Abort,
        SesCode::Rebuild,
        SesCode::Ifa,
        SesCode::Ica,
        SesCode::ConsCheck,
        SesCode::Hotspare,
        SesCode::RsvdDev,
        SesCode::Ok,
        SesCode::Ident,
        SesCode::Rm,
        SesCode::Insert,
        SesCode::Missing,
        SesCode::Dnr,
        SesCode::Active,
        SesCode::EnableBb,
        SesCode::EnableBa,
        SesCode::Devoff,
        SesCode::Fault,
        SesCode::Prdfail,
    ];

    fn cli_name(self) -> &'static str {
        match self {
            SesCode::Abort => "ses_abort",
            SesCode::Rebuild => "ses_rebuild",
            SesCode::Ifa => "ses_ifa",
            SesCode::Ica => "ses_ica",
            SesCode::ConsCheck => "ses_cons_check",
            SesCode::Hotspare => "ses_hotspare",
            SesCode::RsvdDev => "ses_rsvd_dev",
            SesCode::Ok => "ses_ok",
            SesCode::Ident => "ses_ident",
            SesCode::Rm => "ses_rm",
            SesCode::Insert => "ses_insert",
            SesCode::Missing => "ses_missing",
            SesCode::Dnr => "ses_dnr",
            SesCode::Active => "ses_active",
            SesCode::EnableBb => "ses_enable_bb",
            SesCode::EnableBa => "ses_enable_ba",
            SesCode::Devoff => "ses_devoff",
            SesCode::Fault => "ses_fault",
            SesCode::Prdfail => "ses_prdfail",
        }
    }
}

impl IbpiPattern {
    /// Patterns in the documented priority order, lowest first.
    pub const PRIORITY_ORDER: [IbpiPattern; 10] = [
        IbpiPattern::Normal,
        IbpiPattern::OneshotNormal,
        IbpiPattern::Degraded,
        IbpiPattern::Hotspare,
        IbpiPattern::Rebuild,
        IbpiPattern::FailedArray,
        IbpiPattern::Pfa,
        IbpiPattern::Failure,
        IbpiPattern::Locate,
        IbpiPattern::LocateOff,
    ];

    /// Priority rank; a higher pattern replaces a lower when both are
    /// suggested for one device in one scan.
    pub fn priority(self) -> u8 {
        match self {
            IbpiPattern::Unknown => 0,
            IbpiPattern::Normal => 1,
            IbpiPattern::OneshotNormal => 2,
            IbpiPattern::Degraded => 3,
            IbpiPattern::Hotspare => 4,
            IbpiPattern::Rebuild => 5,
            IbpiPattern::FailedArray => 6,
            IbpiPattern::Pfa => 7,
            IbpiPattern::Failure => 8,
            // the composite carries failure semantics plus locate
            IbpiPattern::LocateAndFailure => 9,
            IbpiPattern::Locate => 10,
            IbpiPattern::LocateOff => 11,
            // transient udev markers outrank everything so a hot-plug event
            // is never lost to a same-scan RAID suggestion
            IbpiPattern::Added => 12,
            IbpiPattern::Removed => 13,
            IbpiPattern::Ses(_) => 14,
        }
    }

    /// Combine two patterns suggested for the same device within one scan.
    pub fn accumulate(self, other: IbpiPattern) -> IbpiPattern {
        if other.priority() > self.priority() {
            other
        } else {
            self
        }
    }

    /// Pattern actually put on the wire: the bookkeeping-only states fall
    /// back to `Normal`.
    pub fn effective(self) -> IbpiPattern {
        match self {
            IbpiPattern::Unknown | IbpiPattern::OneshotNormal => IbpiPattern::Normal,
            other => other,
        }
    }

    /// Canonical upper-case name used in log lines.
    pub fn name(self) -> &'static str {
        match self {
            IbpiPattern::Unknown => "UNKNOWN",
            IbpiPattern::Normal => "NORMAL",
            IbpiPattern::OneshotNormal => "ONESHOT_NORMAL",
            IbpiPattern::Degraded => "ICA",
            IbpiPattern::Hotspare => "HOTSPARE",
            IbpiPattern::Rebuild => "REBUILD",
            IbpiPattern::FailedArray => "IFA",
            IbpiPattern::Pfa => "PFA",
            IbpiPattern::Failure => "FAILURE",
            IbpiPattern::Locate => "LOCATE",
            IbpiPattern::LocateOff => "LOCATE_OFF",
            IbpiPattern::LocateAndFailure => "LOCATE_AND_FAILURE",
            IbpiPattern::Added => "ADDED",
            IbpiPattern::Removed => "REMOVED",
            IbpiPattern::Ses(SesCode::Abort) => "SES_ABORT",
            IbpiPattern::Ses(SesCode::Rebuild) => "SES_REBUILD",
            IbpiPattern::Ses(SesCode::Ifa) => "SES_IFA",
            IbpiPattern::Ses(SesCode::Ica) => "SES_ICA",
            IbpiPattern::Ses(SesCode::ConsCheck) => "SES_CONS_CHECK",
            IbpiPattern::Ses(SesCode::Hotspare) => "SES_HOTSPARE",
            IbpiPattern::Ses(SesCode::RsvdDev) => "SES_RSVD_DEV",
            IbpiPattern::Ses(SesCode::Ok) => "SES_OK",
            IbpiPattern::Ses(SesCode::Ident) => "SES_IDENT",
            IbpiPattern::Ses(SesCode::Rm) => "SES_RM",
            IbpiPattern::Ses(SesCode::Insert) => "SES_INSERT",
            IbpiPattern::Ses(SesCode::Missing) => "SES_MISSING",
            IbpiPattern::Ses(SesCode::Dnr) => "SES_DNR",
            IbpiPattern::Ses(SesCode::Active) => "SES_ACTIVE",
            IbpiPattern::Ses(SesCode::EnableBb) => "SES_ENABLE_BB",
            IbpiPattern::Ses(SesCode::EnableBa) => "SES_ENABLE_BA",
            IbpiPattern::Ses(SesCode::Devoff) => "SES_DEVOFF",
            IbpiPattern::Ses(SesCode::Fault) => "SES_FAULT",
            IbpiPattern::Ses(SesCode::Prdfail) => "SES_PRDFAIL",
        }
    }
}

impl fmt::Display for IbpiPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for IbpiPattern {
    type Err = Status;

    /// Parse a CLI pattern name, including synonyms and `ses_*` codes.
    fn from_str(s: &str) -> Result<Self, Status> {
        let lower = s.to_ascii_lowercase();
        let pattern = match lower.as_str() {
            "normal" | "off" => IbpiPattern::Normal,
            "ica" | "degraded" => IbpiPattern::Degraded,
            "rebuild" => IbpiPattern::Rebuild,
            "ifa" | "failed_array" => IbpiPattern::FailedArray,
            "hotspare" => IbpiPattern::Hotspare,
            "pfa" => IbpiPattern::Pfa,
            "failure" | "disk_failed" => IbpiPattern::Failure,
            "locate" => IbpiPattern::Locate,
            "locate_off" => IbpiPattern::LocateOff,
            "locate_and_failure" => IbpiPattern::LocateAndFailure,
            other => {
                let ses = SesCode::ALL
                    .iter()
                    .find(|code| code.cli_name() == other)
                    .copied();
                match ses {
                    Some(code) => IbpiPattern::Ses(code),
                    None => return Err(Status::InvalidState(s.to_string())),
                }
            }
        };
        Ok(pattern)
    }
}

/// Carry a device's pattern from the previous scan into the current one.
///
/// `current` is the pattern held in the long-lived device record (possibly
/// a transient udev marker); `observed` is what the RAID model suggested
/// this scan, `Unknown` when the device has no RAID membership. Returns the
/// pattern the record should hold for emission.
pub fn merge(current: IbpiPattern, observed: IbpiPattern) -> IbpiPattern {
    // Hot-plug markers resolve first.
    match current {
        // scan immediately after a udev add: blink off once
        IbpiPattern::Added => return IbpiPattern::OneshotNormal,
        // the device is gone; its LED must show failure
        IbpiPattern::Removed => return IbpiPattern::Failure,
        // the one-shot has been emitted; release the device
        IbpiPattern::OneshotNormal => {
            if observed == IbpiPattern::Unknown {
                return IbpiPattern::Unknown;
            }
        }
        _ => {}
    }

    if observed == IbpiPattern::Unknown {
        // A device that left its array while showing a non-normal pattern
        // gets one LED-off emission, then is left untouched.
        if current != IbpiPattern::Unknown && current != IbpiPattern::Normal {
            return IbpiPattern::OneshotNormal;
        }
        return current;
    }

    // A failed drive that reappears as a spare keeps showing failure until
    // a new arrival or an explicit locate_off clears it.
    if current == IbpiPattern::Failure && observed == IbpiPattern::Hotspare {
        return IbpiPattern::Failure;
    }

    observed
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_priority_order_is_strictly_increasing() {
        let ranks: Vec<u8> = IbpiPattern::PRIORITY_ORDER
            .iter()
            .map(|p| p.priority())
            .collect();
        for pair in ranks.windows(2) {
            assert!(pair[0] < pair[1], "priority order must be strict");
        }
    }

    #[test]
    fn test_cli_names_round_trip() {
        let named = [
            ("normal", IbpiPattern::Normal),
            ("off", IbpiPattern::Normal),
            ("ica", IbpiPattern::Degraded),
            ("degraded", IbpiPattern::Degraded),
            ("rebuild", IbpiPattern::Rebuild),
            ("ifa", IbpiPattern::FailedArray),
            ("failed_array", IbpiPattern::FailedArray),
            ("hotspare", IbpiPattern::Hotspare),
            ("pfa", IbpiPattern::Pfa),
            ("failure", IbpiPattern::Failure),
            ("disk_failed", IbpiPattern::Failure),
            ("locate", IbpiPattern::Locate),
            ("locate_off", IbpiPattern::LocateOff),
            ("locate_and_failure", IbpiPattern::LocateAndFailure),
        ];
        for (name, pattern) in named {
            assert_eq!(name.parse::<IbpiPattern>().unwrap(), pattern, "{name}");
        }
        for code in SesCode::ALL {
            let parsed: IbpiPattern = code.cli_name().parse().unwrap();
            assert_eq!(parsed, IbpiPattern::Ses(code));
        }
        assert!("sparkle".parse::<IbpiPattern>().is_err());
    }

    #[test]
    fn test_unknown_name_maps_to_invalid_state() {
        let err = "blinkenlights".parse::<IbpiPattern>().unwrap_err();
        assert_eq!(err.exit_code(), crate::status::exit_code::INVALID_STATE);
    }

    #[test]
    fn test_added_becomes_oneshot_then_unknown() {
        let after_add = merge(IbpiPattern::Added, IbpiPattern::Unknown);
        assert_eq!(after_add, IbpiPattern::OneshotNormal);
        let after_oneshot = merge(after_add, IbpiPattern::Unknown);
        assert_eq!(after_oneshot, IbpiPattern::Unknown);
    }

    #[test]
    fn test_removed_resolves_to_failure() {
        assert_eq!(
            merge(IbpiPattern::Removed, IbpiPattern::Unknown),
            IbpiPattern::Failure
        );
        // even with a same-scan suggestion: the device is gone
        assert_eq!(
            merge(IbpiPattern::Removed, IbpiPattern::Normal),
            IbpiPattern::Failure
        );
    }

    #[test]
    fn test_failed_drive_is_sticky_against_hotspare() {
        assert_eq!(
            merge(IbpiPattern::Failure, IbpiPattern::Hotspare),
            IbpiPattern::Failure
        );
        // but a concrete non-spare observation replaces it
        assert_eq!(
            merge(IbpiPattern::Failure, IbpiPattern::Normal),
            IbpiPattern::Normal
        );
    }

    #[test]
    fn test_unknown_observation_turns_nonnormal_off_once() {
        assert_eq!(
            merge(IbpiPattern::Rebuild, IbpiPattern::Unknown),
            IbpiPattern::OneshotNormal
        );
        assert_eq!(
            merge(IbpiPattern::Normal, IbpiPattern::Unknown),
            IbpiPattern::Normal
        );
        assert_eq!(
            merge(IbpiPattern::Unknown, IbpiPattern::Unknown),
            IbpiPattern::Unknown
        );
    }

    #[test]
    fn test_rebuild_drops_back_to_normal_when_sync_finishes() {
        // a fresh observation replaces the previous pattern outright
        assert_eq!(
            merge(IbpiPattern::Rebuild, IbpiPattern::Normal),
            IbpiPattern::Normal
        );
    }

    #[test]
    fn test_effective_patterns() {
        assert_eq!(IbpiPattern::Unknown.effective(), IbpiPattern::Normal);
        assert_eq!(IbpiPattern::OneshotNormal.effective(), IbpiPattern::Normal);
        assert_eq!(IbpiPattern::Locate.effective(), IbpiPattern::Locate);
    }

    fn arb_pattern() -> impl Strategy<Value = IbpiPattern> {
        prop::sample::select(IbpiPattern::PRIORITY_ORDER.to_vec())
    }

    proptest! {
        /// Within one scan, combining suggestions is max() under the
        /// priority order.
        #[test]
        fn prop_accumulate_is_priority_max(a in arb_pattern(), b in arb_pattern()) {
            let combined = a.accumulate(b);
            let max = if a.priority() >= b.priority() { a } else { b };
            prop_assert_eq!(combined, max);
        }

        /// accumulate() is commutative up to priority ties.
        #[test]
        fn prop_accumulate_commutes(a in arb_pattern(), b in arb_pattern()) {
            prop_assert_eq!(
                a.accumulate(b).priority(),
                b.accumulate(a).priority()
            );
        }
    }
}
