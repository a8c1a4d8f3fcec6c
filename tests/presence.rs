//! Presence tracking against a fake device daemon and a real arbiter.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use audio_hub::presence::{ConnectOutcome, DeviceInfo, PresenceEvent, PresenceTracker};
use audio_hub::sources::ActivatableSource;
use common::{drain, harness, observe, Harness, MockPresence, MockSource};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const PHONE: &str = "AA:BB:CC:DD:EE:01";
const TABLET: &str = "AA:BB:CC:DD:EE:02";

struct Fixture {
    h: Harness,
    bluetooth: Arc<MockSource>,
    daemon: Arc<MockPresence>,
    tracker: Arc<PresenceTracker>,
}

fn fixture(connected: Vec<DeviceInfo>) -> Fixture {
    let bluetooth = MockSource::new("bluetooth");
    let h = harness(vec![
        bluetooth.clone() as Arc<dyn ActivatableSource>,
        MockSource::new("spotify") as Arc<dyn ActivatableSource>,
    ]);
    let daemon = MockPresence::with_devices(connected);
    let tracker = Arc::new(PresenceTracker::new(
        "bluetooth",
        daemon.clone(),
        h.arbiter.clone(),
        h.hub.clone(),
    ));
    Fixture {
        h,
        bluetooth,
        daemon,
        tracker,
    }
}

#[tokio::test]
async fn test_first_device_becomes_active_and_takes_output() {
    let f = fixture(vec![]);
    let mut status = observe(&f.h.hub, "bluetooth").await;

    let outcome = f
        .tracker
        .on_device_connected(DeviceInfo::new(PHONE, "Phone"))
        .await;

    assert_eq!(outcome, ConnectOutcome::Adopted);
    assert!(f.h.arbiter.is_current("bluetooth"));

    let messages = drain(&mut status);
    let devices = messages
        .iter()
        .find(|m| m.kind == "devices_status")
        .expect("devices_status published");
    assert_eq!(devices.data["active_device"]["address"], PHONE);
    assert_eq!(devices.data["active_device"]["display_name"], "Phone");
    assert!(devices.data["pending_device"].is_null());
}

#[tokio::test]
async fn test_duplicate_connect_is_idempotent() {
    let f = fixture(vec![]);

    f.tracker
        .on_device_connected(DeviceInfo::new(PHONE, "Phone"))
        .await;
    let again = f
        .tracker
        .on_device_connected(DeviceInfo::new(&PHONE.to_lowercase(), "Phone"))
        .await;

    assert_eq!(again, ConnectOutcome::AlreadyActive);
    assert_eq!(f.bluetooth.activation_count(), 1);
    assert!(f.daemon.disconnected().is_empty());
    assert_eq!(f.tracker.state().active_device.unwrap().address, PHONE);
}

#[tokio::test]
async fn test_second_device_is_turned_away() {
    let f = fixture(vec![]);

    f.tracker
        .on_device_connected(DeviceInfo::new(PHONE, "Phone"))
        .await;
    let outcome = f
        .tracker
        .on_device_connected(DeviceInfo::new(TABLET, "Tablet"))
        .await;

    assert_eq!(outcome, ConnectOutcome::Rejected);
    assert_eq!(f.daemon.disconnected(), vec![TABLET.to_string()]);

    let state = f.tracker.state();
    assert_eq!(state.active_device.unwrap().address, PHONE);
    assert!(state.pending_device.is_none());
    assert_eq!(f.bluetooth.activation_count(), 1);
}

#[tokio::test]
async fn test_disconnect_for_unknown_device_is_noop() {
    let f = fixture(vec![]);
    f.tracker
        .on_device_connected(DeviceInfo::new(PHONE, "Phone"))
        .await;
    let mut status = observe(&f.h.hub, "bluetooth").await;

    assert!(!f.tracker.on_device_disconnected(TABLET).await);
    assert!(drain(&mut status).is_empty());
    assert!(f.h.arbiter.is_current("bluetooth"));
}

#[tokio::test]
async fn test_active_device_leaving_releases_output() {
    let f = fixture(vec![]);
    f.tracker
        .on_device_connected(DeviceInfo::new(PHONE, "Phone"))
        .await;

    // BlueZ reports removals by object path
    let removed = f
        .tracker
        .on_device_disconnected("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_01")
        .await;

    assert!(removed);
    assert!(f.tracker.state().active_device.is_none());
    assert_eq!(f.h.arbiter.current_state().current_source, None);
    assert_eq!(f.bluetooth.deactivation_count(), 1);
}

#[tokio::test]
async fn test_device_leaving_does_not_release_other_source() {
    let f = fixture(vec![]);
    f.tracker
        .on_device_connected(DeviceInfo::new(PHONE, "Phone"))
        .await;
    f.h.arbiter.switch_to("spotify").await.unwrap();

    f.tracker.on_device_disconnected(PHONE).await;
    assert!(f.h.arbiter.is_current("spotify"));
}

#[tokio::test]
async fn test_user_disconnect_goes_through_daemon() {
    let f = fixture(vec![DeviceInfo::new(PHONE, "Phone")]);
    f.tracker
        .on_device_connected(DeviceInfo::new(PHONE, "Phone"))
        .await;

    f.tracker
        .disconnect_device(&PHONE.to_lowercase())
        .await
        .unwrap();

    assert_eq!(f.daemon.disconnected(), vec![PHONE.to_string()]);
    assert!(f.tracker.state().active_device.is_none());
    assert_eq!(f.h.arbiter.current_state().current_source, None);
}

#[tokio::test]
async fn test_reconcile_adopts_first_and_drops_extras() {
    let f = fixture(vec![
        DeviceInfo::new(PHONE, "Phone"),
        DeviceInfo::new(TABLET, "Tablet"),
    ]);

    let state = f.tracker.reconcile().await;

    assert_eq!(state.active_device.unwrap().address, PHONE);
    assert!(state.pending_device.is_none());
    assert_eq!(f.daemon.disconnected(), vec![TABLET.to_string()]);
    assert!(f.h.arbiter.is_current("bluetooth"));
}

#[tokio::test]
async fn test_reconcile_with_nothing_connected_clears_state() {
    let f = fixture(vec![]);
    f.tracker
        .on_device_connected(DeviceInfo::new(PHONE, "Phone"))
        .await;
    assert!(f.h.arbiter.is_current("bluetooth"));

    let state = f.tracker.reconcile().await;

    assert!(state.active_device.is_none());
    assert!(state.pending_device.is_none());
    assert_eq!(f.h.arbiter.current_state().current_source, None);
}

#[tokio::test]
async fn test_unavailable_daemon_counts_as_no_devices() {
    let f = fixture(vec![DeviceInfo::new(PHONE, "Phone")]);
    f.tracker
        .on_device_connected(DeviceInfo::new(PHONE, "Phone"))
        .await;
    f.daemon.unavailable.store(true, Ordering::SeqCst);

    let state = f.tracker.reconcile().await;

    assert!(state.active_device.is_none());
    assert!(f.daemon.disconnected().is_empty());
}

#[tokio::test]
async fn test_run_applies_events_in_order() {
    let f = fixture(vec![]);
    let (tx, rx) = mpsc::channel(8);

    tx.send(PresenceEvent::Connected(DeviceInfo::new(PHONE, "Phone")))
        .await
        .unwrap();
    tx.send(PresenceEvent::Connected(DeviceInfo::new(TABLET, "Tablet")))
        .await
        .unwrap();
    tx.send(PresenceEvent::Disconnected(PHONE.to_string()))
        .await
        .unwrap();
    drop(tx);

    // Returns once the channel is drained and closed
    f.tracker.clone().run(rx, CancellationToken::new()).await;

    assert_eq!(f.daemon.disconnected(), vec![TABLET.to_string()]);
    assert!(f.tracker.state().active_device.is_none());
    assert_eq!(f.bluetooth.activation_count(), 1);
    assert_eq!(f.bluetooth.deactivation_count(), 1);
}

#[tokio::test]
async fn test_run_stops_on_cancel() {
    let f = fixture(vec![]);
    let (_tx, rx) = mpsc::channel::<PresenceEvent>(8);
    let cancel = CancellationToken::new();
    cancel.cancel();

    f.tracker.clone().run(rx, cancel).await;
    assert!(f.tracker.state().active_device.is_none());
}
