//! `iscsiadm` initiator commands and session parsing.

use std::collections::BTreeMap;

use crate::exec::Command;

/// Initiator administration tool.
pub const ISCSIADM: &str = "iscsiadm";

/// `iscsiadm -m session -P3`: active sessions with their attached disks.
pub fn session_list() -> Command {
    Command::new(ISCSIADM).args(["-m", "session", "-P3"])
}

/// `iscsiadm -m discovery -t sendtargets -p <portal>`.
pub fn discover(portal: &str) -> Command {
    Command::new(ISCSIADM).args(["-m", "discovery", "-t", "sendtargets", "-p", portal])
}

/// `iscsiadm -m node -T <target> -p <portal> -l`.
pub fn login(target: &str, portal: &str) -> Command {
    Command::new(ISCSIADM).args(["-m", "node", "-T", target, "-p", portal, "-l"])
}

/// `iscsiadm -m node -T <target> -u`.
pub fn logout(target: &str) -> Command {
    Command::new(ISCSIADM).args(["-m", "node", "-T", target, "-u"])
}

/// Maps each session's target to the last SCSI disk attached under it.
pub fn parse_sessions<S: AsRef<str>>(lines: &[S]) -> BTreeMap<String, String> {
    let mut mappings = BTreeMap::new();
    let mut current: Option<String> = None;

    for line in lines {
        let line = line.as_ref();
        if let Some(rest) = after(line, "Target: ") {
            current = rest.split_whitespace().next().map(str::to_string);
        }
        if let Some(rest) = after(line, "Attached scsi disk ") {
            if let (Some(target), Some(disk)) = (&current, rest.split_whitespace().next()) {
                mappings.insert(target.clone(), disk.to_string());
            }
        }
    }
    mappings
}

/// True if any discovery record names `target`.
pub fn discovery_has_target<S: AsRef<str>>(lines: &[S], target: &str) -> bool {
    lines.iter().any(|line| line.as_ref().contains(target))
}

fn after<'a>(line: &'a str, marker: &str) -> Option<&'a str> {
    line.find(marker).map(|idx| &line[idx + marker.len()..])
}
