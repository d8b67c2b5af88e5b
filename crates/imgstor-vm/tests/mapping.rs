//! Attach, detach and listing through the message interface.

mod common;

use std::sync::Arc;

use common::*;
use imgstor_probe::fakes::FakeRunner;
use imgstor_proto::{Action, DevListBody, Failure, NodeType, Payload, Status, TargetDevice};
use imgstor_store::SyncJob;
use imgstor_vm::VmConfig;

const TARGET: &str = "iqn.2001-04.com.nas-0-1-v1";

fn iscsi_config() -> VmConfig {
    VmConfig {
        node_name: NODE.to_string(),
        ..VmConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_map_builds_overlay_on_sync_host() {
    let mut h = harness(sync_config(), host(TARGET, "sdc", 0));

    let body = format!(
        r#"{{"action":"map_zvol","target":"{}","nas":"{}","size":"10","zvol":"v1"}}"#,
        TARGET, NAS
    );
    h.controller.dispatch(&request(&body, "m1")).await.unwrap();

    let (props, payload) = next_reply(&mut h.nas_inbox);
    assert_eq!(props.correlation_id.as_deref(), Some("m1"));
    assert_eq!(props.reply_to.as_deref(), Some(NODE));
    assert_eq!(
        payload,
        Payload::Action(Action::ZvolMapped {
            target: TARGET.to_string(),
            bdev: Some("/dev/mapper/v1-snap".to_string()),
            status: Status::Success,
            error: None,
        })
    );

    assert_eq!(
        h.runner.calls(),
        vec![
            argv(&["iscsiadm", "-m", "discovery", "-t", "sendtargets", "-p", NAS]),
            argv(&["iscsiadm", "-m", "node", "-T", TARGET, "-p", NAS, "-l"]),
            argv(&["iscsiadm", "-m", "session", "-P3"]),
            argv(&["zfs", "destroy", "-r", "tank/v1"]),
            argv(&["zfs", "create", "-V", "10gb", "tank/v1"]),
            argv(&["zfs", "create", "-V", "9gb", "tank/v1-temp-write"]),
            argv(&[
                "dmsetup",
                "create",
                "v1-snap",
                "--table",
                "0 18874368 snapshot /dev/sdc /dev/zvol/tank/v1-temp-write P 16",
            ]),
        ]
    );
    assert!(h.store.lock_holder("v1").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_map_temp_volume_capped() {
    let mut h = harness(sync_config(), host(TARGET, "sdc", 0));
    let body = format!(
        r#"{{"action":"map_zvol","target":"{}","nas":"{}","size":100,"zvol":"v1"}}"#,
        TARGET, NAS
    );
    h.controller.dispatch(&request(&body, "m1")).await.unwrap();
    next_reply(&mut h.nas_inbox);
    assert!(h
        .runner
        .called_with(&["zfs", "create", "-V", "35gb", "tank/v1-temp-write"]));
    assert!(h.runner.called_with(&[
        "dmsetup",
        "create",
        "v1-snap",
        "--table",
        "0 73400320 snapshot /dev/sdc /dev/zvol/tank/v1-temp-write P 16",
    ]));
}

#[tokio::test]
async fn test_map_plain_iscsi_host() {
    let mut h = harness(iscsi_config(), host(TARGET, "sdc", 0));
    let body = format!(
        r#"{{"action":"map_zvol","target":"{}","nas":"{}","size":10}}"#,
        TARGET, NAS
    );
    h.controller.dispatch(&request(&body, "m1")).await.unwrap();

    let (_, payload) = next_reply(&mut h.nas_inbox);
    assert!(matches!(
        payload,
        Payload::Action(Action::ZvolMapped { bdev: Some(ref b), status: Status::Success, .. }) if b == "/dev/sdc"
    ));
    assert_eq!(h.runner.call_count(), 3);
    assert!(h.store.lock_holder(TARGET).is_none());
}

#[tokio::test]
async fn test_map_target_not_discovered() {
    let mut h = harness(sync_config(), host("iqn.2001-04.com.nas-0-1-other", "sdc", 0));
    let body = format!(
        r#"{{"action":"map_zvol","target":"{}","nas":"{}","size":10,"zvol":"v1"}}"#,
        TARGET, NAS
    );
    h.controller.dispatch(&request(&body, "m1")).await.unwrap();

    let (_, payload) = next_reply(&mut h.nas_inbox);
    match payload {
        Payload::Action(Action::ZvolMapped { status, error, .. }) => {
            assert_eq!(status, Status::Error);
            assert!(error.unwrap().contains("Could not find iSCSI target"));
        }
        other => panic!("unexpected reply {:?}", other),
    }
    assert_eq!(h.runner.call_count(), 1);
    assert!(h.store.lock_holder("v1").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_map_device_never_appears() {
    let discovery = format!("10.2.20.247:3260,1 {}", TARGET);
    let runner = Arc::new(FakeRunner::new(move |argv| match argv[2].as_str() {
        "discovery" => Ok(FakeRunner::lines(&discovery)),
        _ => Ok(Vec::new()),
    }));
    let mut h = harness(sync_config(), runner);
    let body = format!(
        r#"{{"action":"map_zvol","target":"{}","nas":"{}","size":10,"zvol":"v1"}}"#,
        TARGET, NAS
    );
    h.controller.dispatch(&request(&body, "m1")).await.unwrap();

    let (_, payload) = next_reply(&mut h.nas_inbox);
    assert!(matches!(
        payload,
        Payload::Action(Action::ZvolMapped { status: Status::Error, .. })
    ));
    let lookups = h
        .runner
        .calls()
        .iter()
        .filter(|c| c[2] == "session")
        .count();
    assert_eq!(lookups, 4);
}

#[tokio::test]
async fn test_unmap_logs_out_on_iscsi_host() {
    let mut h = harness(iscsi_config(), host(TARGET, "sdc", 0));
    let body = format!(
        r#"{{"action":"unmap_zvol","target":"{}","zvol":"v1"}}"#,
        TARGET
    );
    h.controller.dispatch(&request(&body, "m2")).await.unwrap();

    assert!(h.runner.called_with(&["iscsiadm", "-m", "node", "-T", TARGET, "-u"]));
    let (props, payload) = next_reply(&mut h.nas_inbox);
    assert_eq!(props.correlation_id.as_deref(), Some("m2"));
    assert_eq!(
        payload,
        Payload::Action(Action::ZvolUnmapped {
            target: Some(TARGET.to_string()),
            zvol: Some("v1".to_string()),
            status: Status::Success,
            error: None,
        })
    );
}

#[tokio::test]
async fn test_unmap_removes_idle_overlay() {
    let runner = Arc::new(FakeRunner::new(|argv| match argv[1].as_str() {
        "info" => Ok(vec!["0".to_string()]),
        _ => Ok(Vec::new()),
    }));
    let mut h = harness(sync_config(), runner);
    let body = format!(
        r#"{{"action":"unmap_zvol","target":"{}","zvol":"v1"}}"#,
        TARGET
    );
    h.controller.dispatch(&request(&body, "m2")).await.unwrap();

    assert_eq!(
        h.runner.calls(),
        vec![
            argv(&["dmsetup", "info", "-c", "--noheadings", "-o", "open", "v1-snap"]),
            argv(&["dmsetup", "remove", "--retry", "v1-snap"]),
        ]
    );
    let (_, payload) = next_reply(&mut h.nas_inbox);
    assert!(matches!(
        payload,
        Payload::Action(Action::ZvolUnmapped { status: Status::Success, .. })
    ));
}

#[tokio::test]
async fn test_unmap_busy_volume() {
    let mut h = harness(sync_config(), host(TARGET, "sdc", 0));
    h.store.acquire("v1", "nas-0-2").unwrap();
    let body = format!(
        r#"{{"action":"unmap_zvol","target":"{}","zvol":"v1"}}"#,
        TARGET
    );
    h.controller.dispatch(&request(&body, "m3")).await.unwrap();

    let (_, payload) = next_reply(&mut h.nas_inbox);
    assert_eq!(
        payload,
        Payload::Action(Action::ZvolUnmapped {
            target: Some(TARGET.to_string()),
            zvol: Some("v1".to_string()),
            status: Status::Error,
            error: Some("ZVol v1 is busy".to_string()),
        })
    );
    assert_eq!(h.runner.call_count(), 0);
    assert_eq!(h.store.lock_holder("v1").unwrap().requester, "nas-0-2");
}

#[tokio::test]
async fn test_unknown_action_is_unsupported() {
    let mut h = harness(sync_config(), Arc::new(FakeRunner::silent()));
    h.controller
        .dispatch(&request(r#"{"action":"resize_zvol","zvol":"v1"}"#, "m4"))
        .await
        .unwrap();
    let (_, payload) = next_reply(&mut h.nas_inbox);
    assert_eq!(payload, Payload::Failure(Failure::new("action_unsupported")));
    assert_eq!(h.runner.call_count(), 0);
}

#[tokio::test]
async fn test_malformed_request_gets_error_reply() {
    let mut h = harness(sync_config(), Arc::new(FakeRunner::silent()));
    h.controller
        .dispatch(&request(r#"{"action":"unmap_zvol","zvol":"v1"}"#, "m5"))
        .await
        .unwrap();
    let (props, payload) = next_reply(&mut h.nas_inbox);
    assert_eq!(props.correlation_id.as_deref(), Some("m5"));
    match payload {
        Payload::Failure(failure) => {
            assert_eq!(failure.status, Status::Error);
            assert!(failure.error.contains("target"));
        }
        other => panic!("unexpected reply {:?}", other),
    }
}

#[tokio::test]
async fn test_list_dev_iscsi_host() {
    let mut h = harness(iscsi_config(), host(TARGET, "sdc", 0));
    h.controller
        .dispatch(&request(r#"{"action":"list_dev"}"#, "m6"))
        .await
        .unwrap();
    let (_, payload) = next_reply(&mut h.nas_inbox);
    assert_eq!(
        payload,
        Payload::Action(Action::DevList {
            status: Status::Success,
            node_type: NodeType::Iscsi,
            body: DevListBody::Iscsi(vec![
                TargetDevice {
                    target: "iqn.2001-04.com.nas-0-1-compute-0-2-0-vol".to_string(),
                    device: "sdb".to_string(),
                },
                TargetDevice {
                    target: TARGET.to_string(),
                    device: "sdc".to_string(),
                },
            ]),
        })
    );
}

#[test]
fn test_list_dev_sync_host() {
    let sessions = session_listing(TARGET, "sdc");
    let runner = Arc::new(FakeRunner::new(move |argv| match argv[0].as_str() {
        "iscsiadm" => Ok(FakeRunner::lines(&sessions)),
        "dmsetup" => Ok(FakeRunner::lines(
            "v1-snap: 0 20971520 snapshot-merge 16/73400320 32\nv2-snap: 0 41943040 linear",
        )),
        _ => Ok(Vec::new()),
    }));
    let h = harness(sync_config(), runner);
    h.store
        .enqueue_sync(SyncJob::new("v1", TARGET, 20971520, NAS, None))
        .unwrap();

    let listing = h.controller.list_dev();
    let body = match listing {
        Action::DevList {
            node_type: NodeType::Sync,
            body: DevListBody::Sync(body),
            ..
        } => body,
        other => panic!("unexpected listing {:?}", other),
    };
    let keys: Vec<&String> = body.keys().collect();
    assert_eq!(keys, vec!["v1", "v2"]);

    let v1 = &body["v1"];
    assert_eq!(v1.dev, "v1-snap");
    assert_eq!(v1.status, "snapshot-merge");
    assert_eq!(v1.size, 10);
    assert_eq!(v1.synced.as_deref(), Some("16/73400320 32"));
    assert_eq!(v1.target.as_deref(), Some(TARGET));
    assert_eq!(v1.bdev.as_deref(), Some("sdc"));
    assert_eq!(v1.started, Some(false));
    let queued = v1.time.unwrap();
    assert!(
        (1_000_000_000..10_000_000_000).contains(&queued),
        "queue time in epoch seconds, got {}",
        queued
    );

    let v2 = &body["v2"];
    assert_eq!(v2.status, "linear");
    assert_eq!(v2.size, 20);
    assert_eq!(v2.synced, None);
    assert_eq!(v2.target, None);
    assert_eq!(v2.started, None);
}
