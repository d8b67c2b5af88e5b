//! Shared fixtures for the coordinator integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use imgstor_probe::fakes::FakeRunner;
use imgstor_proto::{Delivery, LocalBus, Payload, Properties};
use imgstor_store::JobStore;
use imgstor_sync::{Coordinator, PollOutcome, StaticInventory, SyncConfig};
use tokio::sync::mpsc::UnboundedReceiver;

pub const NODE: &str = "nas-0-1";
pub const COMPUTE: &str = "compute-0-1";
pub const PLAIN: &str = "compute-0-2";

/// Abridged `tgtadm --op show --mode target` with two exports.
pub const TARGETS: &str = "\
Target 1: iqn.2001-04.com.nas-0-1-vol1
    System information:
        Driver: iscsi
        State: ready
    LUN information:
        LUN: 0
            Type: controller
            Backing store path: None
        LUN: 1
            Type: disk
            Backing store path: /dev/tank/vol1
Target 2: iqn.2001-04.com.nas-0-1-vol2
    LUN information:
        LUN: 1
            Type: disk
            Backing store path: /dev/tank/vol2";

pub const TARGET1: &str = "iqn.2001-04.com.nas-0-1-vol1";
pub const TARGET2: &str = "iqn.2001-04.com.nas-0-1-vol2";

/// Storage host exporting [`TARGETS`]; every other command succeeds
/// silently.
pub fn nas() -> Arc<FakeRunner> {
    Arc::new(FakeRunner::new(|argv| {
        let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
        match argv.as_slice() {
            ["tgtadm", "--op", "show", ..] => Ok(FakeRunner::lines(TARGETS)),
            _ => Ok(Vec::new()),
        }
    }))
}

pub fn config() -> SyncConfig {
    SyncConfig {
        node_name: NODE.to_string(),
        net_suffix: Some("ibnet".to_string()),
        sync_hosts: vec![COMPUTE.to_string()],
        ..SyncConfig::default()
    }
}

pub struct Harness {
    pub coordinator: Coordinator,
    pub runner: Arc<FakeRunner>,
    pub store: Arc<JobStore>,
    pub bus: LocalBus,
    pub compute_inbox: UnboundedReceiver<Delivery>,
}

pub fn harness(runner: Arc<FakeRunner>) -> Harness {
    let store = Arc::new(JobStore::in_memory());
    let bus = LocalBus::new();
    let compute_inbox = bus.mailbox(COMPUTE);
    let config = config();
    let inventory = Arc::new(StaticInventory::new(config.sync_hosts.clone()));
    let coordinator = Coordinator::new(
        config,
        store.clone(),
        runner.clone(),
        Arc::new(bus.clone()),
        inventory,
    );
    Harness {
        coordinator,
        runner,
        store,
        bus,
        compute_inbox,
    }
}

/// A notification from `from`.
pub fn notification(body: &str, from: &str) -> Delivery {
    Delivery {
        props: Properties::new().reply_to(from).message_id("n1"),
        body: body.to_string(),
    }
}

/// Polls until the running transfer has been collected.
pub async fn poll_until_done(coordinator: &mut Coordinator) -> PollOutcome {
    for _ in 0..1000 {
        match coordinator.poll().await {
            PollOutcome::Started { .. } | PollOutcome::InFlight { .. } => {
                tokio::time::sleep(Duration::from_millis(5)).await
            }
            outcome => return outcome,
        }
    }
    panic!("transfer never finished");
}

/// Next published message, decoded.
pub fn next_message(inbox: &mut UnboundedReceiver<Delivery>) -> (Properties, Payload) {
    let delivery = inbox.try_recv().expect("a message was published");
    let payload = Payload::from_json(&delivery.body).expect("message decodes");
    (delivery.props, payload)
}

pub fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}
