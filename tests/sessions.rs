//! End-to-end session scenarios against the simulated adapter.
//!
//! Every test runs on a paused clock, so timings are exact and the
//! multi-second waits cost nothing.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout_at, Instant};

use scale_rs::adapter::{CharProperties, GattCharacteristic};
use scale_rs::identity::identify;
use scale_rs::prelude::*;
use scale_rs::protocol::{short_uuid, WEIGHT_CHARACTERISTIC, WEIGHT_MEASUREMENT_CHARACTERISTIC};
use scale_rs::sim::{battery_characteristic, weight_characteristic};

// ── Helpers ───────────────────────────────────────────────────────────────────

fn adv(id: &str, address: &str) -> Advertisement {
    Advertisement {
        peripheral_id: id.into(),
        local_name: Some(format!("Device {id}")),
        address: Some(address.into()),
        ..Default::default()
    }
}

fn device(id: &str) -> TrackedDevice {
    let advertisement = adv(id, "C8:47:8C:00:00:01");
    let now = Instant::now();
    TrackedDevice {
        identity: identify(&advertisement),
        advertisement,
        first_seen: now,
        last_seen: now,
    }
}

/// Everything published on `sub` within `window` from now.
async fn drain<E>(sub: &mut Subscription<E>, window: Duration) -> Vec<E> {
    let deadline = Instant::now() + window;
    let mut out = vec![];
    while let Ok(Some(event)) = timeout_at(deadline, sub.recv()).await {
        out.push(event);
    }
    out
}

fn names(devices: &[TrackedDevice]) -> Vec<String> {
    devices.iter().map(|d| d.name().to_owned()).collect()
}

fn frame(dg: u16) -> [u8; 8] {
    let [lo, hi] = dg.to_le_bytes();
    [0, 0, lo, hi, 0, 0, 0, 0]
}

fn discovery(sim: &SimAdapter) -> DiscoverySession<SimAdapter> {
    DiscoverySession::new(Arc::new(sim.clone()), DiscoveryConfig::default())
}

fn connection(sim: &SimAdapter) -> ConnectionSession<SimAdapter> {
    ConnectionSession::new(Arc::new(sim.clone()), ConnectionConfig::default())
}

// ── Discovery ─────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn burst_of_sightings_yields_one_debounced_snapshot() {
    let sim = SimAdapter::new();
    let discovery = discovery(&sim);
    let mut events = discovery.subscribe();
    discovery.start().await.unwrap();

    sim.advertise(adv("A", "AA:00:00:00:00:01"));
    sleep(Duration::from_millis(50)).await;
    sim.advertise(adv("A", "AA:00:00:00:00:01"));
    sleep(Duration::from_millis(10)).await;
    sim.advertise(adv("B", "BB:00:00:00:00:02"));

    let events = drain(&mut events, Duration::from_secs(1)).await;
    assert_eq!(events.len(), 3, "{events:?}");
    match (&events[0], &events[1], &events[2]) {
        (
            DiscoveryEvent::Discovered(a),
            DiscoveryEvent::Discovered(b),
            DiscoveryEvent::Updated(snapshot),
        ) => {
            assert_eq!(a.name(), "Device A");
            assert_eq!(b.name(), "Device B");
            assert_eq!(names(snapshot), ["Device A", "Device B"]);
        }
        other => panic!("unexpected events: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn silent_device_is_pruned_after_the_presence_window() {
    let sim = SimAdapter::new();
    let discovery = discovery(&sim);
    let mut events = discovery.subscribe();
    discovery.start().await.unwrap();

    sim.advertise(adv("A", "AA:00:00:00:00:01"));
    let seen = drain(&mut events, Duration::from_secs(4)).await;
    assert!(matches!(seen.last(), Some(DiscoveryEvent::Updated(s)) if s.len() == 1));
    assert_eq!(discovery.snapshot().len(), 1);

    let later = drain(&mut events, Duration::from_secs(4)).await;
    assert!(
        matches!(later.as_slice(), [DiscoveryEvent::Updated(s)] if s.is_empty()),
        "{later:?}"
    );
    assert!(discovery.snapshot().is_empty());
}

#[tokio::test(start_paused = true)]
async fn regular_sightings_keep_a_device_alive() {
    let sim = SimAdapter::new();
    let discovery = discovery(&sim);
    discovery.start().await.unwrap();

    for _ in 0..12 {
        sim.advertise(adv("A", "AA:00:00:00:00:01"));
        sleep(Duration::from_secs(1)).await;
    }
    let snapshot = discovery.snapshot();
    assert_eq!(names(&snapshot), ["Device A"]);
    assert!(snapshot[0].last_seen - snapshot[0].first_seen >= Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn snapshot_keeps_first_seen_order_under_updates() {
    let sim = SimAdapter::new();
    let discovery = discovery(&sim);
    let mut events = discovery.subscribe();
    discovery.start().await.unwrap();

    for (id, addr) in [("A", "01"), ("B", "02"), ("C", "03")] {
        sim.advertise(adv(id, &format!("AA:00:00:00:00:{addr}")));
        sleep(Duration::from_millis(200)).await;
    }
    sim.advertise(adv("C", "AA:00:00:00:00:03"));
    sim.advertise(adv("A", "AA:00:00:00:00:01"));

    let events = drain(&mut events, Duration::from_secs(1)).await;
    let Some(DiscoveryEvent::Updated(last)) = events.last() else {
        panic!("no snapshot: {events:?}");
    };
    assert_eq!(names(last), ["Device A", "Device B", "Device C"]);
}

#[tokio::test(start_paused = true)]
async fn stop_is_silent_and_forgets_devices() {
    let sim = SimAdapter::new();
    let discovery = discovery(&sim);
    let mut events = discovery.subscribe();
    discovery.start().await.unwrap();

    sim.advertise(adv("A", "AA:00:00:00:00:01"));
    sleep(Duration::from_millis(20)).await;
    discovery.stop().await;
    sim.advertise(adv("B", "BB:00:00:00:00:02"));

    // The pending debounce was cancelled along with the loop.
    let events = drain(&mut events, Duration::from_secs(2)).await;
    assert!(
        matches!(events.as_slice(), [DiscoveryEvent::Discovered(_)]),
        "{events:?}"
    );
    assert!(discovery.snapshot().is_empty());
    assert!(!sim.is_scanning());
}

#[tokio::test(start_paused = true)]
async fn dropped_subscription_stops_receiving() {
    let sim = SimAdapter::new();
    let discovery = discovery(&sim);
    let mut keep = discovery.subscribe();
    let gone = discovery.subscribe();
    gone.unsubscribe();
    discovery.start().await.unwrap();

    sim.advertise(adv("A", "AA:00:00:00:00:01"));
    assert_eq!(drain(&mut keep, Duration::from_secs(1)).await.len(), 2);
}

// ── Connection ────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn connect_reads_battery_once_and_streams_weight() {
    let sim = SimAdapter::new();
    let scale = SimPeripheral::scale("p1", 87);
    sim.add_peripheral(scale.clone());
    let session = connection(&sim);
    let mut events = session.subscribe();

    session.connect(&device("p1")).await.unwrap();
    assert_eq!(session.state(), ConnectionState::Connected);

    let status = session.status();
    assert!(status.has_weight && status.has_battery);
    assert_eq!(status.battery.map(|b| b.level), Some(87));

    scale.notify(WEIGHT_CHARACTERISTIC, &frame(100));
    let events = drain(&mut events, Duration::from_millis(100)).await;
    assert!(matches!(events[0], ScaleEvent::Connecting));
    assert!(matches!(&events[1], ScaleEvent::Connected(name) if name == "Device p1"));
    assert!(matches!(&events[2], ScaleEvent::Battery(b) if b.level == 87));
    assert!(matches!(&events[3], ScaleEvent::Weight(w) if w.grams == 10.0 && w.kg == 0.01));
    assert_eq!(events.len(), 4);
    assert_eq!(session.status().weight.map(|w| w.grams), Some(10.0));
}

#[tokio::test(start_paused = true)]
async fn identical_weight_frames_are_reported_once() {
    let sim = SimAdapter::new();
    let scale = SimPeripheral::scale("p1", 50);
    sim.add_peripheral(scale.clone());
    let session = connection(&sim);
    session.connect(&device("p1")).await.unwrap();
    let mut events = session.subscribe();

    scale.notify(WEIGHT_CHARACTERISTIC, &frame(100));
    scale.notify(WEIGHT_CHARACTERISTIC, &frame(100));
    scale.notify(WEIGHT_CHARACTERISTIC, &frame(250));

    let grams: Vec<f64> = drain(&mut events, Duration::from_millis(100))
        .await
        .into_iter()
        .filter_map(|e| match e {
            ScaleEvent::Weight(w) => Some(w.grams),
            _ => None,
        })
        .collect();
    assert_eq!(grams, [10.0, 25.0]);
}

#[tokio::test(start_paused = true)]
async fn sig_weight_measurement_is_used_as_fallback() {
    let sim = SimAdapter::new();
    let scale = SimPeripheral::new("p1").with_characteristic(GattCharacteristic {
        uuid: WEIGHT_MEASUREMENT_CHARACTERISTIC,
        service: short_uuid(0x181d),
        properties: CharProperties {
            indicate: true,
            ..Default::default()
        },
    });
    sim.add_peripheral(scale.clone());
    let session = connection(&sim);
    session.connect(&device("p1")).await.unwrap();
    let mut events = session.subscribe();

    scale.notify(WEIGHT_MEASUREMENT_CHARACTERISTIC, &frame(12_050));
    let events = drain(&mut events, Duration::from_millis(100)).await;
    assert!(matches!(events.as_slice(), [ScaleEvent::Weight(w)] if w.grams == 1205.0));
}

#[tokio::test(start_paused = true)]
async fn missing_battery_characteristic_is_not_available_and_silent() {
    let sim = SimAdapter::new();
    sim.add_peripheral(SimPeripheral::new("p1").with_characteristic(weight_characteristic()));
    let session = connection(&sim);
    let mut events = session.subscribe();

    session.connect(&device("p1")).await.unwrap();
    assert_eq!(session.state(), ConnectionState::Connected);
    assert!(!session.status().has_battery);

    assert_eq!(
        session.read_battery().await,
        Err(ScaleError::NotAvailable("Battery level"))
    );
    let events = drain(&mut events, Duration::from_millis(100)).await;
    assert!(!events.iter().any(|e| matches!(e, ScaleEvent::Battery(_))));
}

#[tokio::test(start_paused = true)]
async fn empty_battery_payload_is_invalid() {
    let sim = SimAdapter::new();
    sim.add_peripheral(
        SimPeripheral::new("p1")
            .with_characteristic(battery_characteristic())
            .with_battery(&[]),
    );
    let session = connection(&sim);
    session.connect(&device("p1")).await.unwrap();

    assert_eq!(session.read_battery().await, Err(ScaleError::InvalidPayload));
    assert!(session.status().battery.is_none());
}

#[tokio::test(start_paused = true)]
async fn battery_reads_never_overlap() {
    let sim = SimAdapter::new();
    let scale = SimPeripheral::scale("p1", 64).with_read_delay(Duration::from_millis(50));
    sim.add_peripheral(scale.clone());
    let session = connection(&sim);
    session.connect(&device("p1")).await.unwrap();

    let (a, b, c) = tokio::join!(
        session.read_battery(),
        session.read_battery(),
        session.read_battery()
    );
    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    assert_eq!(scale.reads(), 4);
    assert_eq!(scale.max_concurrent_reads(), 1);
}

#[tokio::test(start_paused = true)]
async fn second_connect_while_connecting_fails_fast() {
    let sim = SimAdapter::new();
    sim.add_peripheral(SimPeripheral::scale("p1", 90).with_connect_delay(Duration::from_millis(100)));
    let session = connection(&sim);
    let target = device("p1");

    let (first, second) = tokio::join!(session.connect(&target), session.connect(&target));
    assert_eq!(first, Ok(()));
    assert_eq!(second, Err(ScaleError::AlreadyConnecting));
    assert_eq!(session.state(), ConnectionState::Connected);

    assert_eq!(session.connect(&target).await, Err(ScaleError::AlreadyConnecting));
}

#[tokio::test(start_paused = true)]
async fn failed_connect_enters_error_and_allows_retry() {
    let sim = SimAdapter::new();
    sim.add_peripheral(SimPeripheral::new("bad").with_connect_failure("page timeout"));
    sim.add_peripheral(SimPeripheral::scale("good", 70));
    let session = connection(&sim);
    let mut events = session.subscribe();

    let err = session.connect(&device("bad")).await.unwrap_err();
    assert_eq!(err, ScaleError::Adapter("page timeout".into()));
    let status = session.status();
    assert_eq!(status.state, ConnectionState::Error);
    assert_eq!(status.last_error.as_deref(), Some("Bluetooth adapter error: page timeout"));

    let seen = drain(&mut events, Duration::from_millis(10)).await;
    assert!(matches!(seen.last(), Some(ScaleEvent::Error(_))));

    session.connect(&device("good")).await.unwrap();
    assert_eq!(session.state(), ConnectionState::Connected);
    assert!(session.status().last_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn unknown_peripheral_is_an_error() {
    let sim = SimAdapter::new();
    let session = connection(&sim);
    assert!(matches!(
        session.connect(&device("ghost")).await,
        Err(ScaleError::Adapter(_))
    ));
    assert_eq!(session.state(), ConnectionState::Error);
}

#[tokio::test(start_paused = true)]
async fn hung_connect_times_out() {
    let sim = SimAdapter::new();
    let slow = SimPeripheral::scale("slow", 10).with_connect_delay(Duration::from_secs(60));
    sim.add_peripheral(slow);
    let session = connection(&sim);

    let started = Instant::now();
    assert_eq!(
        session.connect(&device("slow")).await,
        Err(ScaleError::Timeout("BLE connect"))
    );
    let limit = ConnectionConfig::default().connect_timeout;
    assert!(started.elapsed() >= limit && started.elapsed() < limit * 2);
    assert_eq!(session.state(), ConnectionState::Error);
}

#[tokio::test(start_paused = true)]
async fn peripheral_drop_moves_to_disconnected() {
    let sim = SimAdapter::new();
    let scale = SimPeripheral::scale("p1", 55);
    sim.add_peripheral(scale.clone());
    let session = connection(&sim);
    session.connect(&device("p1")).await.unwrap();
    let mut events = session.subscribe();

    scale.drop_link();
    let seen = drain(&mut events, Duration::from_millis(100)).await;
    assert!(matches!(seen.as_slice(), [ScaleEvent::Disconnected]), "{seen:?}");
    assert_eq!(session.state(), ConnectionState::Disconnected);

    // Reconnecting after a drop is allowed.
    session.connect(&device("p1")).await.unwrap();
    assert_eq!(session.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn explicit_disconnect_tears_down_the_link() {
    let sim = SimAdapter::new();
    let scale = SimPeripheral::scale("p1", 55);
    sim.add_peripheral(scale.clone());
    let session = connection(&sim);
    session.connect(&device("p1")).await.unwrap();
    let mut events = session.subscribe();

    session.disconnect().await;
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(!scale.is_connected());

    // The watcher was torn down first, so the drop is reported once.
    let seen = drain(&mut events, Duration::from_millis(100)).await;
    assert!(matches!(seen.as_slice(), [ScaleEvent::Disconnected]), "{seen:?}");
    assert!(matches!(
        session.read_battery().await,
        Err(ScaleError::Adapter(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn disconnect_during_setup_cancels_the_connect() {
    let sim = SimAdapter::new();
    let scale = SimPeripheral::scale("p1", 55).with_connect_delay(Duration::from_millis(100));
    sim.add_peripheral(scale.clone());
    let session = Arc::new(connection(&sim));

    let connecting = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.connect(&device("p1")).await }
    });
    sleep(Duration::from_millis(10)).await;
    assert_eq!(session.state(), ConnectionState::Connecting);

    session.disconnect().await;
    assert_eq!(connecting.await.unwrap(), Err(ScaleError::LinkLost));
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(!scale.is_connected());
}

// ── Discovery → connection hand-off ───────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn selecting_a_discovered_device_connects_to_it() {
    let sim = SimAdapter::new();
    let scale = SimPeripheral::scale("scale-1", 77);
    sim.add_peripheral(scale.clone());
    let adapter = Arc::new(sim.clone());
    let discovery = DiscoverySession::new(Arc::clone(&adapter), DiscoveryConfig::default());
    let session = ConnectionSession::new(adapter, ConnectionConfig::default());
    let mut found = discovery.subscribe();
    discovery.start().await.unwrap();

    sim.advertise(adv("scale-1", "C8:47:8C:00:00:01"));
    let Some(DiscoveryEvent::Discovered(picked)) = found.recv().await else {
        panic!("expected a discovery");
    };

    discovery.stop().await;
    session.connect(&picked).await.unwrap();
    assert!(scale.is_connected());
    assert_eq!(session.status().device.map(|d| d.identity), Some(picked.identity));
}

#[tokio::test(start_paused = true)]
async fn second_connection_session_on_one_adapter_fails_fast() {
    let sim = SimAdapter::new();
    sim.add_peripheral(SimPeripheral::scale("p1", 80));
    sim.add_peripheral(SimPeripheral::scale("p2", 60));
    let first = connection(&sim);
    let second = connection(&sim);

    first.connect(&device("p1")).await.unwrap();
    assert_eq!(
        second.connect(&device("p2")).await,
        Err(ScaleError::AlreadyConnecting)
    );
    assert_eq!(second.state(), ConnectionState::Idle);

    first.disconnect().await;
    second.connect(&device("p2")).await.unwrap();
    assert_eq!(second.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn link_dropped_by_the_peripheral_frees_the_adapter() {
    let sim = SimAdapter::new();
    let scale = SimPeripheral::scale("p1", 80);
    sim.add_peripheral(scale.clone());
    sim.add_peripheral(SimPeripheral::scale("p2", 60));
    let first = connection(&sim);
    let second = connection(&sim);

    first.connect(&device("p1")).await.unwrap();
    scale.drop_link();
    sleep(Duration::from_millis(10)).await;
    assert_eq!(first.state(), ConnectionState::Disconnected);

    second.connect(&device("p2")).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn link_drop_during_service_discovery_ends_disconnected() {
    let sim = SimAdapter::new();
    let scale = SimPeripheral::scale("p1", 80).with_discover_delay(Duration::from_millis(500));
    sim.add_peripheral(scale.clone());
    let session = Arc::new(connection(&sim));
    let mut events = session.subscribe();

    let connecting = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.connect(&device("p1")).await }
    });
    sleep(Duration::from_millis(100)).await;
    assert_eq!(session.state(), ConnectionState::Connected);

    scale.drop_link();
    assert_eq!(connecting.await.unwrap(), Err(ScaleError::LinkLost));
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(session.status().last_error.is_none());

    let seen = drain(&mut events, Duration::from_millis(100)).await;
    assert!(
        matches!(
            seen.as_slice(),
            [ScaleEvent::Connecting, ScaleEvent::Connected(_), ScaleEvent::Disconnected]
        ),
        "{seen:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn status_lists_discovered_characteristics_while_connected() {
    let sim = SimAdapter::new();
    sim.add_peripheral(SimPeripheral::scale("p1", 80));
    let session = connection(&sim);
    assert!(session.status().characteristics.is_empty());

    session.connect(&device("p1")).await.unwrap();
    let listed: Vec<_> = session
        .status()
        .characteristics
        .iter()
        .map(|c| c.uuid)
        .collect();
    assert_eq!(
        listed,
        [weight_characteristic().uuid, battery_characteristic().uuid]
    );

    session.disconnect().await;
    assert!(session.status().characteristics.is_empty());
}
