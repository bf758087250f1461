//! The BLE stack as seen by the sessions.
//!
//! [`Adapter`] and [`GattPeripheral`] are the only seam between the
//! discovery/connection logic and the radio.  [`BtleplugAdapter`] is the real
//! implementation; [`crate::sim::SimAdapter`] is an in-process one used by
//! `--simulate` and by the tests.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, CharPropFlags, Manager as _, Peripheral as _,
    PeripheralProperties, ScanFilter,
};
use btleplug::platform::{Adapter as BtleAdapter, Manager, Peripheral as BtlePeripheral, PeripheralId};
use futures::stream::{BoxStream, StreamExt};
use log::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, ScaleError};
use crate::events::lock;
use crate::protocol::display_uuid;
use crate::types::Advertisement;

/// Owned, sendable stream handed out by the adapter traits.
pub type EventStream<T> = BoxStream<'static, T>;

// ── GATT model ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharProperties {
    pub read: bool,
    pub notify: bool,
    pub indicate: bool,
}

/// A characteristic discovered on a connected peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    /// UUID of the service the characteristic belongs to.
    pub service: Uuid,
    pub properties: CharProperties,
}

/// A value pushed by the peripheral on a subscribed characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub uuid: Uuid,
    pub value: Vec<u8>,
}

impl fmt::Display for CharProperties {
    /// Comma-separated flag names, e.g. `read, notify`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags = [
            (self.read, "read"),
            (self.notify, "notify"),
            (self.indicate, "indicate"),
        ];
        let names: Vec<&str> = flags.iter().filter(|(on, _)| *on).map(|(_, n)| *n).collect();
        if names.is_empty() {
            f.write_str("-")
        } else {
            f.write_str(&names.join(", "))
        }
    }
}

// ── Ownership ────────────────────────────────────────────────────────────────

/// One-owner marker shared by every clone of an adapter.
///
/// The radio runs one scan and one scale connection at a time.  A session
/// claims the matching slot before it touches the radio and holds the
/// [`SlotClaim`] until it is done; a second session sharing the adapter
/// gets `None` and fails fast.
#[derive(Debug, Clone, Default)]
pub struct Slot(Arc<AtomicBool>);

impl Slot {
    pub fn try_claim(&self) -> Option<SlotClaim> {
        self.0
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| SlotClaim(Arc::clone(&self.0)))
    }

    pub fn is_claimed(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Held ownership of a [`Slot`].  Released on drop.
#[derive(Debug)]
pub struct SlotClaim(Arc<AtomicBool>);

impl Drop for SlotClaim {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// ── Traits ───────────────────────────────────────────────────────────────────

#[async_trait]
pub trait Adapter: Send + Sync + 'static {
    type Peripheral: GattPeripheral;

    /// Resolve once the radio is powered on.  May wait indefinitely; callers
    /// bound it with a timeout.
    async fn wait_ready(&self) -> Result<()>;

    /// Stream of every advertisement received from now on, while scanning.
    async fn advertisements(&self) -> Result<EventStream<Advertisement>>;

    async fn start_scan(&self) -> Result<()>;

    async fn stop_scan(&self) -> Result<()>;

    /// Look up a peripheral by the opaque id carried in its advertisements.
    async fn peripheral(&self, id: &str) -> Result<Self::Peripheral>;

    /// Owner of the scan.  Claimed by a discovery session while it runs.
    fn scan_slot(&self) -> &Slot;

    /// Owner of the scale link.  Claimed by a connection session from
    /// `connect()` until the link is gone.
    fn connection_slot(&self) -> &Slot;
}

#[async_trait]
pub trait GattPeripheral: Clone + Send + Sync + 'static {
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    /// Yields one item each time the link to this peripheral drops.
    async fn disconnections(&self) -> Result<EventStream<()>>;

    /// Discover services and return every characteristic found.
    async fn discover(&self) -> Result<Vec<GattCharacteristic>>;

    async fn read(&self, characteristic: &GattCharacteristic) -> Result<Vec<u8>>;

    /// Enable notifications or indications, whichever the characteristic supports.
    async fn subscribe(&self, characteristic: &GattCharacteristic) -> Result<()>;

    /// Values from every subscribed characteristic of this peripheral.
    async fn notifications(&self) -> Result<EventStream<Notification>>;
}

// ── btleplug ─────────────────────────────────────────────────────────────────

/// [`Adapter`] over the first Bluetooth adapter reported by btleplug.
#[derive(Clone)]
pub struct BtleplugAdapter {
    adapter: BtleAdapter,
    /// Advertised id string → platform id.  btleplug ids have no string
    /// parser, so advertisements register the id they were seen with.
    ids: Arc<Mutex<HashMap<String, PeripheralId>>>,
    scan_slot: Slot,
    connection_slot: Slot,
}

impl BtleplugAdapter {
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ScaleError::Adapter("No Bluetooth adapter found".into()))?;
        match adapter.adapter_info().await {
            Ok(info) => info!("Using Bluetooth adapter: {info}"),
            Err(e) => debug!("adapter_info() failed: {e}"),
        }
        Ok(Self {
            adapter,
            ids: Arc::new(Mutex::new(HashMap::new())),
            scan_slot: Slot::default(),
            connection_slot: Slot::default(),
        })
    }
}

fn id_string(id: &PeripheralId) -> String {
    format!("{id:?}")
}

/// Fold btleplug properties into the all-optional [`Advertisement`].
fn to_advertisement(id: &PeripheralId, props: PeripheralProperties) -> Advertisement {
    // CoreBluetooth never exposes the hardware address and reports all zeros.
    let address = (props.address.into_inner() != [0u8; 6]).then(|| props.address.to_string());

    // Re-assemble the raw wire form: company ID (LE) followed by the payload.
    // Pick the lowest company ID so the choice is stable across frames.
    let manufacturer_data = props
        .manufacturer_data
        .iter()
        .min_by_key(|(company, _)| **company)
        .map(|(company, payload)| {
            let mut raw = company.to_le_bytes().to_vec();
            raw.extend_from_slice(payload);
            raw
        });

    Advertisement {
        peripheral_id: id_string(id),
        local_name: props.local_name,
        address,
        services: props.services.iter().map(display_uuid).collect(),
        manufacturer_data,
        tx_power: props.tx_power_level,
        rssi: props.rssi,
    }
}

#[async_trait]
impl Adapter for BtleplugAdapter {
    type Peripheral = BtleplugPeripheral;

    async fn wait_ready(&self) -> Result<()> {
        loop {
            match self.adapter.adapter_state().await {
                Ok(CentralState::PoweredOn) => {
                    info!("Adapter is PoweredOn");
                    return Ok(());
                }
                Ok(state) => debug!("Adapter state = {state:?}, waiting…"),
                Err(e) => {
                    // Some backends cannot report power state; assume on.
                    warn!("adapter_state() error: {e}; proceeding anyway");
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    async fn advertisements(&self) -> Result<EventStream<Advertisement>> {
        let events = self.adapter.events().await?;
        let adapter = self.adapter.clone();
        let ids = Arc::clone(&self.ids);

        let stream = events.filter_map(move |event| {
            let adapter = adapter.clone();
            let ids = Arc::clone(&ids);
            async move {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ManufacturerDataAdvertisement { id, .. }
                    | CentralEvent::ServicesAdvertisement { id, .. } => id,
                    _ => return None,
                };
                let peripheral = adapter.peripheral(&id).await.ok()?;
                let props = match peripheral.properties().await {
                    Ok(Some(props)) => props,
                    Ok(None) => return None,
                    Err(e) => {
                        debug!("properties() failed for {id:?}: {e}");
                        return None;
                    }
                };
                lock(&ids).insert(id_string(&id), id.clone());
                Some(to_advertisement(&id, props))
            }
        });
        Ok(stream.boxed())
    }

    async fn start_scan(&self) -> Result<()> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn peripheral(&self, id: &str) -> Result<BtleplugPeripheral> {
        let pid = lock(&self.ids)
            .get(id)
            .cloned()
            .ok_or_else(|| ScaleError::Adapter(format!("Unknown peripheral {id}")))?;
        let peripheral = self.adapter.peripheral(&pid).await?;
        Ok(BtleplugPeripheral {
            adapter: self.adapter.clone(),
            peripheral,
        })
    }

    fn scan_slot(&self) -> &Slot {
        &self.scan_slot
    }

    fn connection_slot(&self) -> &Slot {
        &self.connection_slot
    }
}

/// [`GattPeripheral`] over a btleplug peripheral.  Keeps the adapter around
/// because disconnects are reported on the adapter's event stream.
#[derive(Clone)]
pub struct BtleplugPeripheral {
    adapter: BtleAdapter,
    peripheral: BtlePeripheral,
}

impl BtleplugPeripheral {
    fn find(&self, target: &GattCharacteristic) -> Result<btleplug::api::Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == target.uuid && c.service_uuid == target.service)
            .ok_or_else(|| {
                ScaleError::Adapter(format!("Characteristic {} not found", target.uuid))
            })
    }
}

#[async_trait]
impl GattPeripheral for BtleplugPeripheral {
    async fn connect(&self) -> Result<()> {
        self.peripheral.connect().await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await?;
        Ok(())
    }

    async fn disconnections(&self) -> Result<EventStream<()>> {
        let events = self.adapter.events().await?;
        let target = self.peripheral.id();
        let stream = events.filter_map(move |event| {
            let hit = matches!(&event, CentralEvent::DeviceDisconnected(id) if *id == target);
            async move { hit.then_some(()) }
        });
        Ok(stream.boxed())
    }

    async fn discover(&self) -> Result<Vec<GattCharacteristic>> {
        // BlueZ signals the connection before its GATT cache is populated;
        // discovering too early returns an empty set.
        #[cfg(target_os = "linux")]
        tokio::time::sleep(Duration::from_millis(600)).await;

        self.peripheral.discover_services().await?;
        Ok(self
            .peripheral
            .characteristics()
            .into_iter()
            .map(|c| GattCharacteristic {
                uuid: c.uuid,
                service: c.service_uuid,
                properties: CharProperties {
                    read: c.properties.contains(CharPropFlags::READ),
                    notify: c.properties.contains(CharPropFlags::NOTIFY),
                    indicate: c.properties.contains(CharPropFlags::INDICATE),
                },
            })
            .collect())
    }

    async fn read(&self, characteristic: &GattCharacteristic) -> Result<Vec<u8>> {
        let c = self.find(characteristic)?;
        Ok(self.peripheral.read(&c).await?)
    }

    async fn subscribe(&self, characteristic: &GattCharacteristic) -> Result<()> {
        let c = self.find(characteristic)?;
        self.peripheral.subscribe(&c).await?;
        Ok(())
    }

    async fn notifications(&self) -> Result<EventStream<Notification>> {
        let stream = self.peripheral.notifications().await?;
        Ok(stream
            .map(|n| Notification {
                uuid: n.uuid,
                value: n.value,
            })
            .boxed())
    }
}
