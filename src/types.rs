use tokio::time::Instant;

use crate::adapter::GattCharacteristic;
use crate::identity::IdentityKey;

/// One advertisement broadcast as reported by the BLE stack.
///
/// Every field is optional: depending on the platform and the peripheral,
/// any of them may be missing (macOS, for example, never reports the
/// hardware address).  Consumers must not assume presence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advertisement {
    /// Opaque platform handle used to open a connection to the peripheral.
    ///
    /// • macOS / Windows: a UUID string
    /// • Linux: the BlueZ device path / MAC
    ///
    /// Never used for identity; see [`crate::identity::identify`].
    pub peripheral_id: String,
    /// Advertised local name (e.g. `"Gourmetmiles Scale"`).
    pub local_name: Option<String>,
    /// Hardware address, when the platform exposes one.
    pub address: Option<String>,
    /// Advertised service identifiers (short form such as `"ffb0"` or a full UUID).
    pub services: Vec<String>,
    /// Raw manufacturer-specific data: 2-byte little-endian company ID followed
    /// by the vendor payload.
    pub manufacturer_data: Option<Vec<u8>>,
    /// Advertised transmit power in dBm.
    pub tx_power: Option<i16>,
    /// Received signal strength in dBm.
    pub rssi: Option<i16>,
}

impl Advertisement {
    /// Local name, or `"(no name)"` when the peripheral does not advertise one.
    pub fn display_name(&self) -> &str {
        self.local_name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or("(no name)")
    }

    /// Hardware address, or `None` when absent or blank.
    pub fn usable_address(&self) -> Option<&str> {
        self.address
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
    }

    /// Bluetooth SIG company identifier from the first two bytes of the
    /// manufacturer data.
    pub fn company_id(&self) -> Option<u16> {
        match self.manufacturer_data.as_deref() {
            Some([lo, hi, ..]) => Some(u16::from_le_bytes([*lo, *hi])),
            _ => None,
        }
    }
}

/// A peripheral currently considered visible.
///
/// Owned by [`crate::tracker::PresenceTracker`]; everything handed out to
/// consumers is a clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedDevice {
    pub identity: IdentityKey,
    /// Most recent advertisement; replaced on every sighting.
    pub advertisement: Advertisement,
    /// Time of the first sighting.  Never changes after creation.
    pub first_seen: Instant,
    /// Time of the most recent sighting.
    pub last_seen: Instant,
}

impl TrackedDevice {
    pub fn name(&self) -> &str {
        self.advertisement.display_name()
    }
}

/// A decoded weight notification.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightReading {
    pub grams: f64,
    /// `grams / 1000`.
    pub kg: f64,
    /// The notification payload exactly as received.
    pub raw: Vec<u8>,
    /// Capture time in milliseconds since the Unix epoch.
    pub timestamp: f64,
}

/// A decoded battery-level read.
#[derive(Debug, Clone, PartialEq)]
pub struct BatteryReading {
    /// State of charge in percent (0–100).
    pub level: u8,
    pub raw: Vec<u8>,
    /// Capture time in milliseconds since the Unix epoch.
    pub timestamp: f64,
}

/// Lifecycle of a [`crate::discovery::DiscoverySession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Stopped,
    /// Waiting for the adapter to power on and the scan to start.
    Starting,
    Scanning,
}

/// Lifecycle of a [`crate::connection::ConnectionSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No device has been selected yet.
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl ConnectionState {
    /// `true` when a new `connect()` may be issued.
    pub fn accepts_connect(self) -> bool {
        matches!(
            self,
            ConnectionState::Idle | ConnectionState::Disconnected | ConnectionState::Error
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Error => "error",
        }
    }
}

/// Point-in-time view of a connection session.
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub device: Option<TrackedDevice>,
    pub weight: Option<WeightReading>,
    pub battery: Option<BatteryReading>,
    /// Present only in [`ConnectionState::Error`].
    pub last_error: Option<String>,
    /// Whether a weight characteristic was found and subscribed.
    pub has_weight: bool,
    /// Whether a readable battery-level characteristic was found.
    pub has_battery: bool,
    /// Everything service discovery reported, in discovery order.  Empty
    /// until the link is fully set up.
    pub characteristics: Vec<GattCharacteristic>,
}

/// Events published by a discovery session.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A never-before-seen identity.  Published immediately, not debounced.
    Discovered(TrackedDevice),
    /// Full debounced snapshot, ordered by first sighting.
    Updated(Vec<TrackedDevice>),
}

/// Events published by a connection session.
///
/// Consumers receive these through a [`crate::events::Subscription`]
/// obtained from [`crate::connection::ConnectionSession::subscribe`].
#[derive(Debug, Clone)]
pub enum ScaleEvent {
    /// `connect()` accepted; the link is being established.
    Connecting,
    /// The link is up.  The inner `String` is the device name.
    Connected(String),
    /// A changed weight frame.
    Weight(WeightReading),
    /// A completed battery read.
    Battery(BatteryReading),
    /// The link was lost or closed.  Emitted for peripheral-initiated drops
    /// regardless of the previous state, and after an explicit disconnect.
    Disconnected,
    /// Connection setup failed; the session is now in [`ConnectionState::Error`].
    Error(String),
}
