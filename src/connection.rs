//! One-device GATT session: connect, locate the scale characteristics,
//! stream weight, read battery on demand.
//!
//! ```text
//! idle ─connect()─▶ connecting ──▶ connected ──link drop / disconnect()──▶ disconnected
//!                        │               │                                      │
//!                        └──failure──▶ error ◀──failure┘        connect() ◀─────┘
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

use crate::adapter::{
    Adapter, EventStream, GattCharacteristic, GattPeripheral, Notification, SlotClaim,
};
use crate::error::{Result, ScaleError};
use crate::events::{lock, Subscribers, Subscription};
use crate::parse::{decode_battery, WeightDeduper};
use crate::protocol::{
    display_uuid, BATTERY_LEVEL_CHARACTERISTIC, BATTERY_SERVICE, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_GATT_DISCOVERY_TIMEOUT, WEIGHT_CHARACTERISTIC, WEIGHT_MEASUREMENT_CHARACTERISTIC,
};
use crate::types::{
    BatteryReading, ConnectionState, ConnectionStatus, ScaleEvent, TrackedDevice, WeightReading,
};

// ── Configuration ─────────────────────────────────────────────────────────────

/// Timeouts for a [`ConnectionSession`].
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Hard limit on the link-layer connect.  BlueZ can otherwise block
    /// forever on a device that went out of range.
    pub connect_timeout: Duration,
    pub discovery_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            discovery_timeout: DEFAULT_GATT_DISCOVERY_TIMEOUT,
        }
    }
}

// ── Characteristic lookup ─────────────────────────────────────────────────────

/// The vendor `ffb2` characteristic with notify, else the SIG Weight
/// Measurement `2a9d` with indicate.
pub fn find_weight_characteristic(chars: &[GattCharacteristic]) -> Option<&GattCharacteristic> {
    chars
        .iter()
        .find(|c| c.uuid == WEIGHT_CHARACTERISTIC && c.properties.notify)
        .or_else(|| {
            chars
                .iter()
                .find(|c| c.uuid == WEIGHT_MEASUREMENT_CHARACTERISTIC && c.properties.indicate)
        })
}

/// Battery Level `2a19` under the Battery Service `180f`, if readable.
pub fn find_battery_characteristic(chars: &[GattCharacteristic]) -> Option<&GattCharacteristic> {
    chars.iter().find(|c| {
        c.service == BATTERY_SERVICE && c.uuid == BATTERY_LEVEL_CHARACTERISTIC && c.properties.read
    })
}

// ── Session ───────────────────────────────────────────────────────────────────

struct Shared {
    state: ConnectionState,
    device: Option<TrackedDevice>,
    weight: Option<WeightReading>,
    battery: Option<BatteryReading>,
    last_error: Option<String>,
    has_weight: bool,
    has_battery: bool,
    characteristics: Vec<GattCharacteristic>,
    /// Ownership of the adapter's scale link from `connect()` until the
    /// session settles in `Disconnected` or `Error`.
    claim: Option<SlotClaim>,
    /// Bumped by every `connect()` and `disconnect()`.  Background tasks and
    /// in-flight setups compare against it to detect that they are stale.
    generation: u64,
}

struct Link<P> {
    peripheral: P,
    battery: Option<GattCharacteristic>,
    tasks: Vec<JoinHandle<()>>,
}

impl Shared {
    /// The link is gone: drop capabilities and free the adapter for others.
    fn release(&mut self) {
        self.has_weight = false;
        self.has_battery = false;
        self.characteristics.clear();
        self.claim = None;
    }
}

impl<P> Link<P> {
    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Connection to one selected device.
///
/// Only one session per adapter can be connecting or connected at a time; a
/// second one sharing the adapter gets [`ScaleError::AlreadyConnecting`].
pub struct ConnectionSession<A: Adapter> {
    adapter: Arc<A>,
    config: ConnectionConfig,
    shared: Arc<Mutex<Shared>>,
    link: Mutex<Option<Link<A::Peripheral>>>,
    /// Serialises battery reads.
    battery_read: tokio::sync::Mutex<()>,
    events: Subscribers<ScaleEvent>,
}

impl<A: Adapter> ConnectionSession<A> {
    pub fn new(adapter: Arc<A>, config: ConnectionConfig) -> Self {
        Self {
            adapter,
            config,
            shared: Arc::new(Mutex::new(Shared {
                state: ConnectionState::Idle,
                device: None,
                weight: None,
                battery: None,
                last_error: None,
                has_weight: false,
                has_battery: false,
                characteristics: Vec::new(),
                claim: None,
                generation: 0,
            })),
            link: Mutex::new(None),
            battery_read: tokio::sync::Mutex::new(()),
            events: Subscribers::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.shared).state
    }

    pub fn status(&self) -> ConnectionStatus {
        let s = lock(&self.shared);
        ConnectionStatus {
            state: s.state,
            device: s.device.clone(),
            weight: s.weight.clone(),
            battery: s.battery.clone(),
            last_error: s.last_error.clone(),
            has_weight: s.has_weight,
            has_battery: s.has_battery,
            characteristics: s.characteristics.clone(),
        }
    }

    /// Register for [`ScaleEvent`]s.  Drop the subscription to unsubscribe.
    pub fn subscribe(&self) -> Subscription<ScaleEvent> {
        self.events.subscribe()
    }

    // ── connect ──────────────────────────────────────────────────────────────

    /// Connect to `device`, subscribe to weight notifications and read the
    /// battery level once.
    ///
    /// Fails with [`ScaleError::AlreadyConnecting`] unless the session is
    /// idle, disconnected or in error and no other session holds the
    /// adapter's link.  If the peripheral drops the link during setup the
    /// session ends in [`ConnectionState::Disconnected`] and this returns
    /// [`ScaleError::LinkLost`].  Any other failure leaves the session in
    /// [`ConnectionState::Error`] and publishes [`ScaleEvent::Error`].
    pub async fn connect(&self, device: &TrackedDevice) -> Result<()> {
        let generation = {
            let mut s = lock(&self.shared);
            if !s.state.accepts_connect() {
                return Err(ScaleError::AlreadyConnecting);
            }
            if s.claim.is_none() {
                let Some(claim) = self.adapter.connection_slot().try_claim() else {
                    warn!("Another session is already connected on this adapter");
                    return Err(ScaleError::AlreadyConnecting);
                };
                s.claim = Some(claim);
            }
            s.generation += 1;
            s.state = ConnectionState::Connecting;
            s.device = Some(device.clone());
            s.weight = None;
            s.battery = None;
            s.last_error = None;
            s.has_weight = false;
            s.has_battery = false;
            s.characteristics.clear();
            s.generation
        };

        // Leftovers of a link that dropped on its own.
        if let Some(mut old) = lock(&self.link).take() {
            old.abort_tasks();
        }

        self.events.publish(ScaleEvent::Connecting);
        info!("Connecting to {} ({})", device.name(), device.advertisement.peripheral_id);

        match self.establish(device, generation).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(generation, e).await),
        }
    }

    async fn establish(&self, device: &TrackedDevice, generation: u64) -> Result<()> {
        let peripheral = self
            .adapter
            .peripheral(&device.advertisement.peripheral_id)
            .await?;

        // Subscribe before connecting so a drop right after connect is not missed.
        let drops = peripheral.disconnections().await?;

        timeout(self.config.connect_timeout, peripheral.connect())
            .await
            .map_err(|_| ScaleError::Timeout("BLE connect"))??;

        let watcher = tokio::spawn(watch_disconnect(
            drops,
            Arc::clone(&self.shared),
            self.events.clone(),
            generation,
        ));
        let attached = self.attach(
            generation,
            Link {
                peripheral: peripheral.clone(),
                battery: None,
                tasks: vec![watcher],
            },
        );
        if let Err(e) = attached {
            // disconnect() ran while the link was coming up.
            if let Err(e) = peripheral.disconnect().await {
                debug!("disconnect after cancelled setup: {e}");
            }
            return Err(e);
        }

        {
            let mut s = lock(&self.shared);
            if s.generation != generation || s.state != ConnectionState::Connecting {
                return Err(ScaleError::LinkLost);
            }
            s.state = ConnectionState::Connected;
        }
        info!("Connected: {}", device.name());
        self.events
            .publish(ScaleEvent::Connected(device.name().to_owned()));

        let chars = timeout(self.config.discovery_timeout, peripheral.discover())
            .await
            .map_err(|_| ScaleError::Timeout("Service discovery"))??;
        debug!(
            "Discovered characteristics: [{}]",
            chars
                .iter()
                .map(|c| display_uuid(&c.uuid))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let weight = find_weight_characteristic(&chars).cloned();
        let battery = find_battery_characteristic(&chars).cloned();

        let weight_task = match &weight {
            Some(c) => {
                let notifications = peripheral.notifications().await?;
                peripheral.subscribe(c).await?;
                info!("Subscribed to weight characteristic {}", display_uuid(&c.uuid));
                Some(tokio::spawn(pump_weight(
                    notifications,
                    c.uuid,
                    Arc::clone(&self.shared),
                    self.events.clone(),
                    generation,
                )))
            }
            None => {
                warn!("{}: no weight characteristic found", device.name());
                None
            }
        };
        if battery.is_none() {
            warn!("{}: no battery level characteristic found", device.name());
        }

        {
            let mut s = lock(&self.shared);
            let mut link = lock(&self.link);
            let live = s.generation == generation && s.state == ConnectionState::Connected;
            match link.as_mut() {
                Some(l) if live => {
                    l.battery = battery.clone();
                    l.tasks.extend(weight_task);
                    s.has_weight = weight.is_some();
                    s.has_battery = battery.is_some();
                    s.characteristics = chars;
                }
                _ => {
                    if let Some(task) = weight_task {
                        task.abort();
                    }
                    return Err(ScaleError::LinkLost);
                }
            }
        }

        if battery.is_some() {
            if let Err(e) = self.read_battery().await {
                warn!("Initial battery read failed: {e}");
            }
        }
        Ok(())
    }

    /// Install `link` unless the setup went stale in the meantime.
    fn attach(&self, generation: u64, mut link: Link<A::Peripheral>) -> Result<()> {
        let s = lock(&self.shared);
        if s.generation != generation {
            link.abort_tasks();
            return Err(ScaleError::LinkLost);
        }
        *lock(&self.link) = Some(link);
        Ok(())
    }

    /// Settle a failed setup and return the error to report.
    ///
    /// A newer `connect()`/`disconnect()` owns the session already: nothing
    /// changes.  A link the peripheral dropped mid-setup leaves the session
    /// `Disconnected` (the watcher reported it) and yields
    /// [`ScaleError::LinkLost`].  Anything else enters the error state.
    async fn fail(&self, generation: u64, e: ScaleError) -> ScaleError {
        let (dropped, link) = {
            let mut s = lock(&self.shared);
            if s.generation != generation {
                return e;
            }
            let dropped = s.state == ConnectionState::Disconnected;
            if !dropped {
                s.state = ConnectionState::Error;
                s.last_error = Some(e.to_string());
                s.release();
            }
            (dropped, lock(&self.link).take())
        };
        let e = if dropped {
            info!("Link dropped during setup ({e})");
            ScaleError::LinkLost
        } else {
            error!("Connection failed: {e}");
            self.events.publish(ScaleEvent::Error(e.to_string()));
            e
        };

        if let Some(mut link) = link {
            link.abort_tasks();
            if let Err(e) = link.peripheral.disconnect().await {
                debug!("disconnect after failed setup: {e}");
            }
        }
        e
    }

    // ── battery ──────────────────────────────────────────────────────────────

    /// Read, store and publish the battery level.
    ///
    /// Returns [`ScaleError::NotAvailable`] without publishing anything when
    /// the device has no battery level characteristic.  Concurrent calls are
    /// queued, never overlapped.
    pub async fn read_battery(&self) -> Result<BatteryReading> {
        let _serialised = self.battery_read.lock().await;

        if self.state() != ConnectionState::Connected {
            return Err(ScaleError::Adapter("No device connected".into()));
        }
        let (peripheral, characteristic) = {
            let link = lock(&self.link);
            let found = link
                .as_ref()
                .and_then(|l| l.battery.clone().map(|c| (l.peripheral.clone(), c)));
            found.ok_or(ScaleError::NotAvailable("Battery level"))?
        };

        let raw = peripheral.read(&characteristic).await?;
        let reading = decode_battery(&raw).ok_or(ScaleError::InvalidPayload)?;
        info!("Battery: {}%", reading.level);

        lock(&self.shared).battery = Some(reading.clone());
        self.events.publish(ScaleEvent::Battery(reading.clone()));
        Ok(reading)
    }

    // ── disconnect ───────────────────────────────────────────────────────────

    /// Tear down the link and enter [`ConnectionState::Disconnected`].
    /// Adapter failures are logged and otherwise ignored.
    pub async fn disconnect(&self) {
        let (previous, link, claim) = {
            let mut s = lock(&self.shared);
            let previous = s.state;
            s.generation += 1;
            if previous != ConnectionState::Idle {
                s.state = ConnectionState::Disconnected;
            }
            s.last_error = None;
            let claim = s.claim.take();
            s.release();
            (previous, lock(&self.link).take(), claim)
        };

        if let Some(mut link) = link {
            link.abort_tasks();
            if let Err(e) = link.peripheral.disconnect().await {
                warn!("Disconnect failed: {e}");
            }
        }
        drop(claim);

        if matches!(
            previous,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Error
        ) {
            info!("Disconnected");
            self.events.publish(ScaleEvent::Disconnected);
        }
    }
}

impl<A: Adapter> Drop for ConnectionSession<A> {
    fn drop(&mut self) {
        if let Some(mut link) = lock(&self.link).take() {
            link.abort_tasks();
        }
        lock(&self.shared).claim = None;
    }
}

// ── Background tasks ──────────────────────────────────────────────────────────

async fn watch_disconnect(
    mut drops: EventStream<()>,
    shared: Arc<Mutex<Shared>>,
    events: Subscribers<ScaleEvent>,
    generation: u64,
) {
    if drops.next().await.is_none() {
        return;
    }
    {
        let mut s = lock(&shared);
        if s.generation != generation {
            return;
        }
        s.state = ConnectionState::Disconnected;
        s.release();
    }
    info!("Disconnect watcher: peripheral dropped the link");
    events.publish(ScaleEvent::Disconnected);
}

async fn pump_weight(
    mut notifications: EventStream<Notification>,
    uuid: Uuid,
    shared: Arc<Mutex<Shared>>,
    events: Subscribers<ScaleEvent>,
    generation: u64,
) {
    let mut dedupe = WeightDeduper::new();
    while let Some(n) = notifications.next().await {
        if n.uuid != uuid {
            continue;
        }
        let Some(reading) = dedupe.accept(&n.value) else {
            continue;
        };
        {
            let mut s = lock(&shared);
            if s.generation != generation {
                break;
            }
            s.weight = Some(reading.clone());
        }
        debug!("Weight: {:.1} g", reading.grams);
        events.publish(ScaleEvent::Weight(reading));
    }
    debug!("Weight notification stream ended");
}
