//! In-process BLE stack.
//!
//! [`SimAdapter`] and [`SimPeripheral`] implement the adapter traits without
//! a radio.  Tests script advertisements, notifications, link drops and
//! failures through them; `--simulate` runs [`spawn_demo`] against one.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use log::{debug, info};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::adapter::{
    Adapter, CharProperties, EventStream, GattCharacteristic, GattPeripheral, Notification, Slot,
};
use crate::error::{Result, ScaleError};
use crate::events::{lock, Subscribers, Subscription};
use crate::protocol::{
    short_uuid, BATTERY_LEVEL_CHARACTERISTIC, BATTERY_SERVICE, WEIGHT_CHARACTERISTIC,
};
use crate::types::Advertisement;

fn into_stream<T: Send + 'static>(sub: Subscription<T>) -> EventStream<T> {
    stream::unfold(sub, |mut sub| async move { sub.recv().await.map(|item| (item, sub)) }).boxed()
}

// ── Adapter ──────────────────────────────────────────────────────────────────

struct AdapterInner {
    powered: watch::Sender<bool>,
    scanning: AtomicBool,
    advertisements: Subscribers<Advertisement>,
    peripherals: Mutex<HashMap<String, SimPeripheral>>,
    scan_failure: Mutex<Option<String>>,
    scan_starts: AtomicUsize,
    scan_stops: AtomicUsize,
    scan_slot: Slot,
    connection_slot: Slot,
}

/// Simulated adapter.  Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SimAdapter {
    inner: Arc<AdapterInner>,
}

impl Default for SimAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl SimAdapter {
    /// A powered-on adapter with no peripherals.
    pub fn new() -> Self {
        let (powered, _) = watch::channel(true);
        Self {
            inner: Arc::new(AdapterInner {
                powered,
                scanning: AtomicBool::new(false),
                advertisements: Subscribers::new(),
                peripherals: Mutex::new(HashMap::new()),
                scan_failure: Mutex::new(None),
                scan_starts: AtomicUsize::new(0),
                scan_stops: AtomicUsize::new(0),
                scan_slot: Slot::default(),
                connection_slot: Slot::default(),
            }),
        }
    }

    pub fn set_powered(&self, on: bool) {
        self.inner.powered.send_replace(on);
    }

    /// Make every following `start_scan` fail with `message` (or succeed again
    /// with `None`).
    pub fn set_scan_failure(&self, message: Option<&str>) {
        *lock(&self.inner.scan_failure) = message.map(str::to_owned);
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.scanning.load(Ordering::SeqCst)
    }

    pub fn scan_starts(&self) -> usize {
        self.inner.scan_starts.load(Ordering::SeqCst)
    }

    pub fn scan_stops(&self) -> usize {
        self.inner.scan_stops.load(Ordering::SeqCst)
    }

    /// Broadcast `adv`.  Dropped unless a scan is running, as on real hardware.
    pub fn advertise(&self, adv: Advertisement) {
        if self.is_scanning() {
            self.inner.advertisements.publish(adv);
        }
    }

    /// End every open advertisement stream, as when the radio goes away.
    /// Streams requested afterwards work again.
    pub fn close_advertisements(&self) {
        self.inner.advertisements.close();
    }

    /// Make `peripheral` connectable under its id.
    pub fn add_peripheral(&self, peripheral: SimPeripheral) {
        let id = peripheral.id().to_owned();
        lock(&self.inner.peripherals).insert(id, peripheral);
    }
}

#[async_trait]
impl Adapter for SimAdapter {
    type Peripheral = SimPeripheral;

    async fn wait_ready(&self) -> Result<()> {
        let mut rx = self.inner.powered.subscribe();
        let powered = rx.wait_for(|on| *on).await.is_ok();
        if !powered {
            return Err(ScaleError::Adapter("adapter closed".into()));
        }
        Ok(())
    }

    async fn advertisements(&self) -> Result<EventStream<Advertisement>> {
        Ok(into_stream(self.inner.advertisements.subscribe()))
    }

    async fn start_scan(&self) -> Result<()> {
        if let Some(message) = lock(&self.inner.scan_failure).clone() {
            return Err(ScaleError::Adapter(message));
        }
        self.inner.scan_starts.fetch_add(1, Ordering::SeqCst);
        self.inner.scanning.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.inner.scan_stops.fetch_add(1, Ordering::SeqCst);
        self.inner.scanning.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn peripheral(&self, id: &str) -> Result<SimPeripheral> {
        lock(&self.inner.peripherals)
            .get(id)
            .cloned()
            .ok_or_else(|| ScaleError::Adapter(format!("Unknown peripheral {id}")))
    }

    fn scan_slot(&self) -> &Slot {
        &self.inner.scan_slot
    }

    fn connection_slot(&self) -> &Slot {
        &self.inner.connection_slot
    }
}

// ── Peripheral ───────────────────────────────────────────────────────────────

struct PeripheralInner {
    id: String,
    characteristics: Vec<GattCharacteristic>,
    battery: Mutex<Vec<u8>>,
    connect_failure: Option<String>,
    connect_delay: Duration,
    discover_delay: Duration,
    read_delay: Duration,
    connected: AtomicBool,
    subscribed: Mutex<HashSet<Uuid>>,
    notifications: Subscribers<Notification>,
    disconnects: Subscribers<()>,
    reads: AtomicUsize,
    reads_in_flight: AtomicUsize,
    max_reads_in_flight: AtomicUsize,
}

/// Simulated GATT peripheral.  Configure with the `with_*` builders before
/// registering it; clones share state.
#[derive(Clone)]
pub struct SimPeripheral {
    inner: Arc<PeripheralInner>,
}

impl SimPeripheral {
    /// A peripheral with no characteristics.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(PeripheralInner {
                id: id.into(),
                characteristics: Vec::new(),
                battery: Mutex::new(Vec::new()),
                connect_failure: None,
                connect_delay: Duration::ZERO,
                discover_delay: Duration::ZERO,
                read_delay: Duration::ZERO,
                connected: AtomicBool::new(false),
                subscribed: Mutex::new(HashSet::new()),
                notifications: Subscribers::new(),
                disconnects: Subscribers::new(),
                reads: AtomicUsize::new(0),
                reads_in_flight: AtomicUsize::new(0),
                max_reads_in_flight: AtomicUsize::new(0),
            }),
        }
    }

    /// A scale exposing the vendor weight characteristic and a battery level.
    pub fn scale(id: impl Into<String>, battery: u8) -> Self {
        Self::new(id)
            .with_characteristic(weight_characteristic())
            .with_characteristic(battery_characteristic())
            .with_battery(&[battery])
    }

    fn edit(mut self, f: impl FnOnce(&mut PeripheralInner)) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => f(inner),
            None => debug!("sim peripheral {} already shared; builder ignored", self.inner.id),
        }
        self
    }

    pub fn with_characteristic(self, c: GattCharacteristic) -> Self {
        self.edit(|p| p.characteristics.push(c))
    }

    /// Raw payload returned by battery-level reads.
    pub fn with_battery(self, payload: &[u8]) -> Self {
        let payload = payload.to_vec();
        self.edit(|p| p.battery = Mutex::new(payload))
    }

    pub fn with_connect_failure(self, message: &str) -> Self {
        let message = message.to_owned();
        self.edit(|p| p.connect_failure = Some(message))
    }

    pub fn with_connect_delay(self, delay: Duration) -> Self {
        self.edit(|p| p.connect_delay = delay)
    }

    pub fn with_discover_delay(self, delay: Duration) -> Self {
        self.edit(|p| p.discover_delay = delay)
    }

    pub fn with_read_delay(self, delay: Duration) -> Self {
        self.edit(|p| p.read_delay = delay)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn set_battery(&self, payload: &[u8]) {
        *lock(&self.inner.battery) = payload.to_vec();
    }

    /// Push `value` on `uuid`.  Delivered only while connected and subscribed.
    pub fn notify(&self, uuid: Uuid, value: &[u8]) {
        if self.is_connected() && lock(&self.inner.subscribed).contains(&uuid) {
            self.inner.notifications.publish(Notification {
                uuid,
                value: value.to_vec(),
            });
        }
    }

    /// Simulate the peripheral going out of range.
    pub fn drop_link(&self) {
        if self.inner.connected.swap(false, Ordering::SeqCst) {
            lock(&self.inner.subscribed).clear();
            self.inner.disconnects.publish(());
        }
    }

    /// Completed characteristic reads.
    pub fn reads(&self) -> usize {
        self.inner.reads.load(Ordering::SeqCst)
    }

    /// Highest number of reads that were ever in flight at the same time.
    pub fn max_concurrent_reads(&self) -> usize {
        self.inner.max_reads_in_flight.load(Ordering::SeqCst)
    }
}

pub fn weight_characteristic() -> GattCharacteristic {
    GattCharacteristic {
        uuid: WEIGHT_CHARACTERISTIC,
        service: short_uuid(0xffb0),
        properties: CharProperties {
            notify: true,
            ..Default::default()
        },
    }
}

pub fn battery_characteristic() -> GattCharacteristic {
    GattCharacteristic {
        uuid: BATTERY_LEVEL_CHARACTERISTIC,
        service: BATTERY_SERVICE,
        properties: CharProperties {
            read: true,
            notify: true,
            ..Default::default()
        },
    }
}

#[async_trait]
impl GattPeripheral for SimPeripheral {
    async fn connect(&self) -> Result<()> {
        let p = &self.inner;
        if !p.connect_delay.is_zero() {
            tokio::time::sleep(p.connect_delay).await;
        }
        if let Some(message) = &p.connect_failure {
            return Err(ScaleError::Adapter(message.clone()));
        }
        p.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.drop_link();
        Ok(())
    }

    async fn disconnections(&self) -> Result<EventStream<()>> {
        Ok(into_stream(self.inner.disconnects.subscribe()))
    }

    async fn discover(&self) -> Result<Vec<GattCharacteristic>> {
        if !self.inner.discover_delay.is_zero() {
            tokio::time::sleep(self.inner.discover_delay).await;
        }
        if !self.is_connected() {
            return Err(ScaleError::Adapter("Not connected".into()));
        }
        Ok(self.inner.characteristics.clone())
    }

    async fn read(&self, characteristic: &GattCharacteristic) -> Result<Vec<u8>> {
        let p = &self.inner;
        if !p.characteristics.iter().any(|c| c == characteristic && c.properties.read) {
            return Err(ScaleError::Adapter(format!(
                "Characteristic {} is not readable",
                characteristic.uuid
            )));
        }

        let in_flight = p.reads_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        p.max_reads_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        if !p.read_delay.is_zero() {
            tokio::time::sleep(p.read_delay).await;
        }
        p.reads_in_flight.fetch_sub(1, Ordering::SeqCst);
        p.reads.fetch_add(1, Ordering::SeqCst);

        if !self.is_connected() {
            return Err(ScaleError::Adapter("Not connected".into()));
        }
        Ok(lock(&p.battery).clone())
    }

    async fn subscribe(&self, characteristic: &GattCharacteristic) -> Result<()> {
        lock(&self.inner.subscribed).insert(characteristic.uuid);
        Ok(())
    }

    async fn notifications(&self) -> Result<EventStream<Notification>> {
        Ok(into_stream(self.inner.notifications.subscribe()))
    }
}

// ── Demo ─────────────────────────────────────────────────────────────────────

/// Id of the scale registered by [`spawn_demo`].
pub const DEMO_SCALE_ID: &str = "sim-scale-01";

const DEMO_TICK: Duration = Duration::from_millis(250);

fn demo_scale_advert(tick: u64) -> Advertisement {
    Advertisement {
        peripheral_id: DEMO_SCALE_ID.into(),
        local_name: Some("Gourmetmiles Scale".into()),
        address: Some("C8:47:8C:00:00:01".into()),
        services: vec!["ffb0".into(), "180f".into()],
        manufacturer_data: Some(vec![0xc0, 0x06, 0x01, (tick & 0xff) as u8]),
        tx_power: Some(0),
        rssi: Some(-55 - (tick % 7) as i16),
    }
}

fn demo_background_adverts(tick: u64) -> Vec<Advertisement> {
    let mut out = vec![Advertisement {
        peripheral_id: "sim-band-01".into(),
        local_name: Some("Mi Smart Band 6".into()),
        address: Some("E1:22:33:44:55:66".into()),
        manufacturer_data: Some(vec![0x57, 0x01, 0x02]),
        rssi: Some(-78 - (tick % 5) as i16),
        ..Default::default()
    }];
    // An anonymous beacon that comes and goes, so pruning is visible.
    if (tick / 40) % 2 == 0 {
        out.push(Advertisement {
            peripheral_id: "sim-beacon".into(),
            services: vec!["feaa".into()],
            rssi: Some(-90),
            ..Default::default()
        });
    }
    out
}

/// Weight in decigrams for the demo scale at `tick`: empty, load placed,
/// settled, removed.  Repeats every 30 s.
fn demo_weight_dg(tick: u64) -> u16 {
    match tick % 120 {
        0..=19 => 0,
        t @ 20..=35 => ((t - 19) * 750) as u16,
        36..=79 => 12_050,
        t @ 80..=87 => (12_050 - (t - 79) * 1_500) as u16,
        _ => 0,
    }
}

fn weight_frame(dg: u16) -> [u8; 8] {
    let [lo, hi] = dg.to_le_bytes();
    [0xac, 0x02, lo, hi, 0x00, 0x00, 0x00, 0x01]
}

/// Register a demo scale on `adapter` and keep it and a few bystanders
/// advertising.  While the scale is connected it streams weight frames.
pub fn spawn_demo(adapter: &SimAdapter) -> JoinHandle<()> {
    let scale = SimPeripheral::scale(DEMO_SCALE_ID, 87);
    adapter.add_peripheral(scale.clone());
    adapter.add_peripheral(SimPeripheral::new("sim-band-01"));

    let adapter = adapter.clone();
    info!("Simulated adapter running with demo scale {DEMO_SCALE_ID}");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(DEMO_TICK);
        let mut tick: u64 = 0;
        loop {
            ticker.tick().await;
            adapter.advertise(demo_scale_advert(tick));
            for adv in demo_background_adverts(tick) {
                adapter.advertise(adv);
            }
            if scale.is_connected() {
                scale.notify(WEIGHT_CHARACTERISTIC, &weight_frame(demo_weight_dg(tick)));
                if tick % 240 == 239 {
                    scale.set_battery(&[86]);
                }
            }
            tick += 1;
        }
    })
}
