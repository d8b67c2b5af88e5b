//! ZFS volume and snapshot commands.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::exec::Command;

/// Suffix of the temporary write-buffer volume paired with each overlay.
pub const TEMP_SUFFIX: &str = "-temp-write";

/// Builds `zfs` commands for a given binary path.
///
/// Locally the binary is found through `PATH`; commands run on a peer over
/// ssh use the absolute path since the remote shell is non-interactive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Zfs {
    bin: &'static str,
}

impl Zfs {
    /// `zfs` resolved through `PATH`.
    pub const fn local() -> Self {
        Self { bin: "zfs" }
    }

    /// `/sbin/zfs`, for commands run on another host.
    pub const fn remote() -> Self {
        Self { bin: "/sbin/zfs" }
    }

    fn cmd(&self) -> Command {
        Command::new(self.bin)
    }

    /// `zfs create -V <size>gb <dataset>`.
    pub fn create_volume(&self, dataset: &str, size_gb: u64) -> Command {
        self.cmd()
            .args(["create", "-V"])
            .arg(format!("{}gb", size_gb))
            .arg(dataset)
    }

    /// `zfs destroy <dataset>`.
    pub fn destroy(&self, dataset: &str) -> Command {
        self.cmd().args(["destroy", dataset])
    }

    /// `zfs destroy -r <dataset>`: the dataset and all its snapshots.
    pub fn destroy_recursive(&self, dataset: &str) -> Command {
        self.cmd().args(["destroy", "-r", dataset])
    }

    /// `zfs snap <dataset>@<snapshot>`.
    pub fn snapshot(&self, dataset: &str, snapshot: &str) -> Command {
        self.cmd().arg("snap").arg(format!("{}@{}", dataset, snapshot))
    }

    /// `zfs send [-i <dataset>@<base>] <dataset>@<snapshot>`.
    pub fn send(&self, dataset: &str, snapshot: &str, base: Option<&str>) -> Command {
        let mut cmd = self.cmd().arg("send");
        if let Some(base) = base {
            cmd = cmd.arg("-i").arg(format!("{}@{}", dataset, base));
        }
        cmd.arg(format!("{}@{}", dataset, snapshot))
    }

    /// `zfs receive -F <dataset>`: overwrite the destination.
    pub fn receive_force(&self, dataset: &str) -> Command {
        self.cmd().args(["receive", "-F", dataset])
    }

    /// `zfs list -t snapshot`.
    pub fn list_snapshots(&self) -> Command {
        self.cmd().args(["list", "-t", "snapshot"])
    }
}

/// `<pool>/<zvol>`.
pub fn dataset(pool: &str, zvol: &str) -> String {
    format!("{}/{}", pool, zvol)
}

/// Name of the write-buffer volume for `zvol`.
pub fn temp_volume(zvol: &str) -> String {
    format!("{}{}", zvol, TEMP_SUFFIX)
}

/// Device node of a zvol.
pub fn zvol_device(pool: &str, zvol: &str) -> String {
    format!("/dev/zvol/{}/{}", pool, zvol)
}

/// Snapshot names of `dataset` from `zfs list -t snapshot` output, in
/// listing order.
pub fn parse_snapshots<S: AsRef<str>>(lines: &[S], dataset: &str) -> Vec<String> {
    let prefix = format!("{}@", dataset);
    lines
        .iter()
        .filter_map(|line| line.as_ref().split_whitespace().next())
        .filter_map(|name| name.strip_prefix(&prefix))
        .map(str::to_string)
        .collect()
}

/// Newest snapshot among `names`.
///
/// Names are millisecond timestamps, so a longer name is newer and equal
/// lengths compare lexically.
pub fn latest_snapshot<S: AsRef<str>>(names: &[S]) -> Option<String> {
    let names: Vec<&str> = names.iter().map(|n| n.as_ref()).collect();
    names
        .into_iter()
        .max_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)))
        .map(str::to_string)
}

/// Snapshot name for the current instant.
pub fn snapshot_name_now() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    millis.to_string()
}
