//! `blockdev` size queries.

use crate::exec::{Command, ExecutionError};

/// `blockdev --getsize <device>`: size in 512-byte sectors.
pub fn get_size(device: &str) -> Command {
    Command::new("blockdev").args(["--getsize", device])
}

/// Parses the single number printed by `blockdev --getsize`.
pub fn parse_size<S: AsRef<str>>(lines: &[S]) -> Result<u64, ExecutionError> {
    let first = lines
        .iter()
        .map(|l| l.as_ref().trim())
        .find(|l| !l.is_empty())
        .ok_or_else(|| ExecutionError::parse("blockdev --getsize", "no output"))?;
    first
        .parse()
        .map_err(|e| ExecutionError::parse("blockdev --getsize", format!("{:?}: {}", first, e)))
}
