//! Shared fixtures for the controller integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use imgstor_probe::fakes::FakeRunner;
use imgstor_probe::ExecutionError;
use imgstor_proto::{Delivery, LocalBus, Payload, Properties};
use imgstor_store::JobStore;
use imgstor_vm::{VmConfig, VmController};
use tokio::sync::mpsc::UnboundedReceiver;

pub const NODE: &str = "compute-0-1";
pub const NAS: &str = "nas-0-1";

/// Abridged `iscsiadm -m session -P3`: one unrelated session, then `target`
/// attached as `disk`.
pub fn session_listing(target: &str, disk: &str) -> String {
    format!(
        "iSCSI Transport Class version 2.0-870
version 6.2.0-873.10.el6
Target: iqn.2001-04.com.nas-0-1-compute-0-2-0-vol
\tCurrent Portal: 10.2.20.254:3260,1
\t\tiSCSI Session State: LOGGED_IN
\t\t************************
\t\tAttached SCSI devices:
\t\t************************
\t\tHost Number: 54 State: running
\t\tscsi54 Channel 00 Id 0 Lun: 1
\t\t\tAttached scsi disk sdb      State: running
Target: {}
\tCurrent Portal: 10.2.20.247:3260,1
\t\tiSCSI Session State: LOGGED_IN
\t\tAttached SCSI devices:
\t\tHost Number: 74 State: running
\t\tscsi74 Channel 00 Id 0 Lun: 1
\t\t\tAttached scsi disk {}      State: running",
        target, disk
    )
}

/// `dmsetup status <zvol>-snap` while merging.
pub fn merge_status(allocated: u64) -> String {
    format!("0 75497472 snapshot-merge {}/73400320 32", allocated)
}

/// Scripted host: `target` is discoverable and attached as `disk`, the
/// overlay reports `allocated` sectors still to merge, every device is
/// 12345 sectors, everything else succeeds silently.
pub fn host(target: &str, disk: &str, allocated: u64) -> Arc<FakeRunner> {
    scripted(target, disk, allocated, None)
}

/// Like [`host`] but every argv starting with `prefix` exits non-zero.
pub fn failing_host(target: &str, disk: &str, prefix: &'static [&'static str]) -> Arc<FakeRunner> {
    scripted(target, disk, 32, Some(prefix))
}

fn scripted(
    target: &str,
    disk: &str,
    allocated: u64,
    fail: Option<&'static [&'static str]>,
) -> Arc<FakeRunner> {
    let sessions = session_listing(target, disk);
    let discovery = format!("10.2.20.247:3260,1 {}", target);
    let status = merge_status(allocated);
    Arc::new(FakeRunner::new(move |argv| {
        if let Some(prefix) = fail {
            if argv.len() >= prefix.len() && argv.iter().zip(prefix).all(|(a, p)| a == p) {
                return Err(ExecutionError::failure(
                    argv.join(" "),
                    Some(1),
                    "",
                    "device-mapper: reload ioctl failed",
                ));
            }
        }
        let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
        let out = match argv.as_slice() {
            ["iscsiadm", "-m", "session", ..] => FakeRunner::lines(&sessions),
            ["iscsiadm", "-m", "discovery", ..] => FakeRunner::lines(&discovery),
            ["dmsetup", "status", ..] => FakeRunner::lines(&status),
            ["blockdev", ..] => vec!["12345".to_string()],
            _ => Vec::new(),
        };
        Ok(out)
    }))
}

pub fn sync_config() -> VmConfig {
    VmConfig {
        node_name: NODE.to_string(),
        sync_enabled: true,
        pool: Some("tank".to_string()),
        ..VmConfig::default()
    }
}

pub struct Harness {
    pub controller: VmController,
    pub runner: Arc<FakeRunner>,
    pub store: Arc<JobStore>,
    pub bus: LocalBus,
    pub nas_inbox: UnboundedReceiver<Delivery>,
}

pub fn harness(config: VmConfig, runner: Arc<FakeRunner>) -> Harness {
    let store = Arc::new(JobStore::in_memory());
    let bus = LocalBus::new();
    let nas_inbox = bus.mailbox(NAS);
    let controller = VmController::new(config, store.clone(), runner.clone(), Arc::new(bus.clone()));
    Harness {
        controller,
        runner,
        store,
        bus,
        nas_inbox,
    }
}

/// A request from the storage node.
pub fn request(body: &str, message_id: &str) -> Delivery {
    Delivery {
        props: Properties::new().reply_to(NAS).message_id(message_id),
        body: body.to_string(),
    }
}

/// Next published reply, decoded.
pub fn next_reply(inbox: &mut UnboundedReceiver<Delivery>) -> (Properties, Payload) {
    let delivery = inbox.try_recv().expect("a reply was published");
    let payload = Payload::from_json(&delivery.body).expect("reply decodes");
    (delivery.props, payload)
}

pub fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}
