//! `tgtadm` target listing on the storage node.

use crate::exec::Command;

/// `tgtadm --op show --mode target`.
pub fn show_targets() -> Command {
    Command::new("tgtadm").args(["--op", "show", "--mode", "target"])
}

/// `tgtadm --lld iscsi --op delete --mode target --tid <tid>`.
pub fn delete_target(tid: u32) -> Command {
    Command::new("tgtadm")
        .args(["--lld", "iscsi", "--op", "delete", "--mode", "target", "--tid"])
        .arg(tid.to_string())
}

/// An exported target and the devices behind its LUNs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TgtTarget {
    /// Target id used by `tgtadm`.
    pub tid: u32,
    /// Target IQN.
    pub name: String,
    /// Backing store paths of the target's disk LUNs.
    pub backing_stores: Vec<String>,
}

impl TgtTarget {
    /// Volume in `pool` that this target exports, from its backing store
    /// path `/dev/<pool>/<zvol>`.
    pub fn volume_in(&self, pool: &str) -> Option<String> {
        let prefix = format!("/dev/{}/", pool);
        self.backing_stores
            .iter()
            .find_map(|path| path.strip_prefix(&prefix))
            .filter(|zvol| !zvol.is_empty() && !zvol.contains('/'))
            .map(str::to_string)
    }
}

/// Parses `tgtadm --op show --mode target`.
pub fn parse_targets<S: AsRef<str>>(lines: &[S]) -> Vec<TgtTarget> {
    let mut targets: Vec<TgtTarget> = Vec::new();

    for line in lines {
        let line = line.as_ref();
        if let Some(rest) = line.strip_prefix("Target ") {
            let mut parts = rest.split_whitespace();
            let tid = parts
                .next()
                .and_then(|t| t.trim_end_matches(':').parse::<u32>().ok());
            if let (Some(tid), Some(name)) = (tid, parts.next()) {
                targets.push(TgtTarget {
                    tid,
                    name: name.to_string(),
                    backing_stores: Vec::new(),
                });
            }
            continue;
        }
        if let Some(path) = line.trim().strip_prefix("Backing store path: ") {
            let path = path.trim();
            if let Some(target) = targets.last_mut() {
                if path.starts_with('/') {
                    target.backing_stores.push(path.to_string());
                }
            }
        }
    }
    targets
}
