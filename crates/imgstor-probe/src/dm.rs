//! Device-mapper overlay: table strings, `dmsetup` commands, status parsing.
//!
//! The overlay `<zvol>-snap` moves through three tables:
//! `snapshot` (writes buffered in the temp volume), `snapshot-merge`
//! (buffered writes folded into the backing volume) and `linear`
//! (straight pass-through to the backing volume).

use std::fmt;
use std::str::FromStr;

use crate::exec::{Command, ExecutionError};

/// Device-mapper administration tool.
pub const DMSETUP: &str = "dmsetup";

/// Exception-store chunk size used for every snapshot table, in sectors.
pub const CHUNK_SECTORS: u32 = 16;

/// Sectors per GiB (512-byte sectors).
pub const SECTORS_PER_GIB: u64 = 1024 * 1024 * 1024 / 512;

/// Device-mapper name of the overlay for `zvol`.
pub fn overlay_name(zvol: &str) -> String {
    format!("{}-snap", zvol)
}

/// Device node of the overlay for `zvol`.
pub fn overlay_path(zvol: &str) -> String {
    format!("/dev/mapper/{}-snap", zvol)
}

/// Volume name for an overlay device name, if it is one of ours.
pub fn zvol_for_overlay(name: &str) -> Option<&str> {
    name.strip_suffix("-snap").filter(|z| !z.is_empty())
}

/// Overlay table mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OverlayMode {
    /// Writes go to the temp volume.
    Snapshot,
    /// Temp volume is being merged into the backing volume.
    SnapshotMerge,
    /// Pass-through to the backing volume.
    Linear,
}

impl OverlayMode {
    /// Target type name as printed by `dmsetup`.
    pub fn as_str(&self) -> &'static str {
        match self {
            OverlayMode::Snapshot => "snapshot",
            OverlayMode::SnapshotMerge => "snapshot-merge",
            OverlayMode::Linear => "linear",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            OverlayMode::Snapshot => 0,
            OverlayMode::SnapshotMerge => 1,
            OverlayMode::Linear => 2,
        }
    }

    /// Modes move forward one step at a time: snapshot, snapshot-merge,
    /// linear. Going straight from snapshot to linear would drop the writes
    /// still held in the exception store.
    pub fn can_transition_to(&self, next: OverlayMode) -> bool {
        next.rank() == self.rank() || next.rank() == self.rank() + 1
    }
}

impl fmt::Display for OverlayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OverlayMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "snapshot" => Ok(OverlayMode::Snapshot),
            "snapshot-merge" => Ok(OverlayMode::SnapshotMerge),
            "linear" => Ok(OverlayMode::Linear),
            other => Err(format!("unknown target type {:?}", other)),
        }
    }
}

/// A one-segment overlay table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Table {
    /// `0 <sectors> snapshot <origin> <cow> P 16`
    Snapshot {
        /// Table length in sectors.
        sectors: u64,
        /// Origin device.
        origin: String,
        /// Exception store device.
        cow: String,
    },
    /// `0 <sectors> snapshot-merge <origin> <cow> P 16`
    SnapshotMerge {
        /// Table length, passed through as reported by `blockdev`.
        sectors: u64,
        /// Device receiving the merged writes.
        origin: String,
        /// Exception store device.
        cow: String,
    },
    /// `0 <sectors> linear <device> 0`
    Linear {
        /// Table length, passed through as reported by `blockdev`.
        sectors: u64,
        /// Backing device.
        device: String,
    },
}

impl Table {
    /// Mode this table puts the overlay in.
    pub fn mode(&self) -> OverlayMode {
        match self {
            Table::Snapshot { .. } => OverlayMode::Snapshot,
            Table::SnapshotMerge { .. } => OverlayMode::SnapshotMerge,
            Table::Linear { .. } => OverlayMode::Linear,
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Table::Snapshot {
                sectors,
                origin,
                cow,
            } => write!(f, "0 {} snapshot {} {} P {}", sectors, origin, cow, CHUNK_SECTORS),
            Table::SnapshotMerge {
                sectors,
                origin,
                cow,
            } => write!(
                f,
                "0 {} snapshot-merge {} {} P {}",
                sectors, origin, cow, CHUNK_SECTORS
            ),
            Table::Linear { sectors, device } => write!(f, "0 {} linear {} 0", sectors, device),
        }
    }
}

/// `dmsetup create <name> --table <table>`.
pub fn create(name: &str, table: &Table) -> Command {
    Command::new(DMSETUP).args(["create", name, "--table"]).arg(table.to_string())
}

/// `dmsetup suspend <device>`.
pub fn suspend(device: &str) -> Command {
    Command::new(DMSETUP).args(["suspend", device])
}

/// `dmsetup reload <device> --table <table>`.
pub fn reload(device: &str, table: &Table) -> Command {
    Command::new(DMSETUP).args(["reload", device, "--table"]).arg(table.to_string())
}

/// `dmsetup resume <device>`.
pub fn resume(device: &str) -> Command {
    Command::new(DMSETUP).args(["resume", device])
}

/// `dmsetup remove --retry <name>`.
pub fn remove(name: &str) -> Command {
    Command::new(DMSETUP).args(["remove", "--retry", name])
}

/// `dmsetup status <name>`.
pub fn status(name: &str) -> Command {
    Command::new(DMSETUP).args(["status", name])
}

/// `dmsetup status` for every device.
pub fn status_all() -> Command {
    Command::new(DMSETUP).arg("status")
}

/// `dmsetup info -c --noheadings -o open <name>`: number of openers.
pub fn open_count(name: &str) -> Command {
    Command::new(DMSETUP).args(["info", "-c", "--noheadings", "-o", "open", name])
}

/// Exception-store usage of a snapshot or snapshot-merge table.
///
/// `dmsetup` prints `<allocated>/<total> <metadata>` for these targets; a
/// merge has finished once the allocated count has dropped to the metadata
/// count. When the metadata field is absent the total stands in for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeProgress {
    /// Sectors still allocated in the exception store.
    pub allocated: u64,
    /// Size of the exception store in sectors.
    pub total: u64,
    /// Sectors used by exception-store metadata.
    pub metadata: Option<u64>,
}

impl MergeProgress {
    /// Left-hand side of the completion comparison.
    pub fn numerator(&self) -> u64 {
        self.allocated
    }

    /// Right-hand side of the completion comparison.
    pub fn denominator(&self) -> u64 {
        self.metadata.unwrap_or(self.total)
    }

    /// True once nothing but metadata is left to merge.
    pub fn is_complete(&self) -> bool {
        self.numerator() == self.denominator()
    }
}

/// One parsed `dmsetup status` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayStatus {
    /// Table length in sectors.
    pub length: u64,
    /// Current target type.
    pub mode: OverlayMode,
    /// Exception-store usage, for snapshot targets that report it.
    pub progress: Option<MergeProgress>,
    /// Target-specific fields after the type, verbatim.
    pub detail: String,
}

impl OverlayStatus {
    /// Table length converted to whole GiB.
    pub fn size_gib(&self) -> u64 {
        self.length / SECTORS_PER_GIB
    }
}

impl FromStr for OverlayStatus {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            return Err(format!("short status line {:?}", line));
        }
        let length = fields[1]
            .parse::<u64>()
            .map_err(|e| format!("bad length {:?}: {}", fields[1], e))?;
        let mode: OverlayMode = fields[2].parse()?;

        let progress = match (mode, fields.get(3)) {
            (OverlayMode::Linear, _) | (_, None) => None,
            (_, Some(usage)) => parse_usage(usage, fields.get(4).copied()),
        };

        Ok(OverlayStatus {
            length,
            mode,
            progress,
            detail: fields[3..].join(" "),
        })
    }
}

fn parse_usage(usage: &str, metadata: Option<&str>) -> Option<MergeProgress> {
    let (allocated, total) = usage.split_once('/')?;
    Some(MergeProgress {
        allocated: allocated.parse().ok()?,
        total: total.parse().ok()?,
        metadata: metadata.and_then(|m| m.parse().ok()),
    })
}

/// Parses the output of `dmsetup status <name>`.
pub fn parse_status<S: AsRef<str>>(lines: &[S]) -> Result<OverlayStatus, ExecutionError> {
    let line = lines
        .iter()
        .map(|l| l.as_ref().trim())
        .find(|l| !l.is_empty())
        .ok_or_else(|| ExecutionError::parse("dmsetup status", "no output"))?;
    line.parse()
        .map_err(|reason: String| ExecutionError::parse("dmsetup status", reason))
}

/// Parses the output of `dmsetup status` (all devices) into
/// `(device name, status)` pairs. Lines for other target types are skipped.
pub fn parse_status_all<S: AsRef<str>>(lines: &[S]) -> Vec<(String, OverlayStatus)> {
    lines
        .iter()
        .filter_map(|line| {
            let (name, rest) = line.as_ref().split_once(": ")?;
            let status = rest.parse::<OverlayStatus>().ok()?;
            Some((name.trim().to_string(), status))
        })
        .collect()
}

/// Parses `dmsetup info -c --noheadings -o open`.
pub fn parse_open_count<S: AsRef<str>>(lines: &[S]) -> Option<u32> {
    lines
        .iter()
        .find_map(|line| line.as_ref().trim().parse::<u32>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_strings() {
        let snap = Table::Snapshot {
            sectors: 20971520,
            origin: "/dev/sdc".into(),
            cow: "/dev/zvol/tank/v1-temp-write".into(),
        };
        assert_eq!(
            snap.to_string(),
            "0 20971520 snapshot /dev/sdc /dev/zvol/tank/v1-temp-write P 16"
        );

        let merge = Table::SnapshotMerge {
            sectors: 12345,
            origin: "/dev/zvol/tank/vol1".into(),
            cow: "/dev/zvol/tank/vol1-temp-write".into(),
        };
        assert_eq!(
            merge.to_string(),
            "0 12345 snapshot-merge /dev/zvol/tank/vol1 /dev/zvol/tank/vol1-temp-write P 16"
        );

        let linear = Table::Linear {
            sectors: 12345,
            device: "/dev/zvol/tank/vol1".into(),
        };
        assert_eq!(linear.to_string(), "0 12345 linear /dev/zvol/tank/vol1 0");
    }

    #[test]
    fn test_reload_command() {
        let table = Table::Linear {
            sectors: 8,
            device: "/dev/zvol/tank/vol1".into(),
        };
        assert_eq!(
            reload("/dev/mapper/vol1-snap", &table).argv(),
            vec![
                "dmsetup",
                "reload",
                "/dev/mapper/vol1-snap",
                "--table",
                "0 8 linear /dev/zvol/tank/vol1 0"
            ]
        );
    }

    #[test]
    fn test_merge_finished_with_metadata_field() {
        let status = parse_status(&["0 75497472 snapshot-merge 32/73400320 32"]).unwrap();
        assert_eq!(status.mode, OverlayMode::SnapshotMerge);
        let progress = status.progress.unwrap();
        assert_eq!(progress.numerator(), 32);
        assert_eq!(progress.denominator(), 32);
        assert!(progress.is_complete());
        assert_eq!(status.detail, "32/73400320 32");
    }

    #[test]
    fn test_merge_running_with_metadata_field() {
        let status = parse_status(&["0 75497472 snapshot-merge 100000/73400320 32"]).unwrap();
        assert!(!status.progress.unwrap().is_complete());
    }

    #[test]
    fn test_merge_two_field_form() {
        let done = parse_status(&["0 12345 snapshot-merge 32/32"]).unwrap();
        assert!(done.progress.unwrap().is_complete());
        let running = parse_status(&["0 12345 snapshot-merge 100/100000"]).unwrap();
        assert!(!running.progress.unwrap().is_complete());
    }

    #[test]
    fn test_linear_has_no_progress() {
        let status = parse_status(&["0 20971520 linear"]).unwrap();
        assert_eq!(status.mode, OverlayMode::Linear);
        assert!(status.progress.is_none());
        assert_eq!(status.size_gib(), 10);
    }

    #[test]
    fn test_invalid_snapshot_has_no_progress() {
        let status = parse_status(&["0 20971520 snapshot Invalid"]).unwrap();
        assert!(status.progress.is_none());
    }

    #[test]
    fn test_parse_status_errors() {
        assert!(parse_status::<&str>(&[]).is_err());
        assert!(parse_status(&["0 100 crypt"]).is_err());
        assert!(parse_status(&["garbage"]).is_err());
    }

    #[test]
    fn test_parse_status_all() {
        let out = [
            "vol1-snap: 0 75497472 snapshot 16/73400320 16",
            "vol2-snap: 0 20971520 linear ",
            "luks-abc: 0 100 crypt",
        ];
        let all = parse_status_all(&out);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].0, "vol1-snap");
        assert_eq!(all[1].1.mode, OverlayMode::Linear);
        assert!(parse_status_all(&["No devices found"]).is_empty());
    }

    #[test]
    fn test_mode_moves_forward_one_step() {
        assert!(OverlayMode::Snapshot.can_transition_to(OverlayMode::SnapshotMerge));
        assert!(OverlayMode::SnapshotMerge.can_transition_to(OverlayMode::Linear));
        assert!(OverlayMode::Linear.can_transition_to(OverlayMode::Linear));
        assert!(!OverlayMode::Snapshot.can_transition_to(OverlayMode::Linear));
        assert!(!OverlayMode::Linear.can_transition_to(OverlayMode::Snapshot));
        assert!(!OverlayMode::Linear.can_transition_to(OverlayMode::SnapshotMerge));
    }

    #[test]
    fn test_overlay_names() {
        assert_eq!(overlay_name("v1"), "v1-snap");
        assert_eq!(overlay_path("v1"), "/dev/mapper/v1-snap");
        assert_eq!(zvol_for_overlay("vm-disk-1-snap"), Some("vm-disk-1"));
        assert_eq!(zvol_for_overlay("-snap"), None);
        assert_eq!(zvol_for_overlay("luks-abc"), None);
    }

    #[test]
    fn test_open_count() {
        assert_eq!(parse_open_count(&["  2"]), Some(2));
        assert_eq!(parse_open_count(&["", "0 "]), Some(0));
        assert_eq!(parse_open_count::<&str>(&[]), None);
    }
}
