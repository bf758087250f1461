//! GATT identifiers and timing constants for BLE smart scales.
//!
//! The scales expose their data through 16-bit SIG-style short UUIDs.  Each
//! is expanded over the Bluetooth base UUID
//! `0000XXXX-0000-1000-8000-00805f9b34fb` so it can be compared directly with
//! the 128-bit [`Uuid`]s reported by the BLE stack (comparison of [`Uuid`]
//! values is case-insensitive by construction).

use std::time::Duration;

use uuid::Uuid;

/// Bluetooth base UUID with the 16-bit slot zeroed.
const BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

/// Expand a 16-bit short UUID over the Bluetooth base UUID.
///
/// ```
/// # use scale_rs::protocol::short_uuid;
/// assert_eq!(
///     short_uuid(0x180f).to_string(),
///     "0000180f-0000-1000-8000-00805f9b34fb"
/// );
/// ```
pub const fn short_uuid(short: u16) -> Uuid {
    Uuid::from_u128(BASE_UUID | ((short as u128) << 96))
}

/// Return the 16-bit short form of `uuid` if it lives in the Bluetooth base
/// namespace, otherwise `None`.
pub fn short_form(uuid: &Uuid) -> Option<u16> {
    let v = uuid.as_u128();
    let mask: u128 = !(0xffff_u128 << 96);
    if v & mask == BASE_UUID {
        Some((v >> 96) as u16)
    } else {
        None
    }
}

/// Render `uuid` the way scales are usually documented: `"ffb2"` for base
/// UUIDs, the full lowercase hyphenated form otherwise.
pub fn display_uuid(uuid: &Uuid) -> String {
    match short_form(uuid) {
        Some(short) => format!("{short:04x}"),
        None => uuid.to_string(),
    }
}

// ── Characteristics ───────────────────────────────────────────────────────────

/// Vendor weight characteristic (notify).  8-byte frames; see
/// [`crate::parse::decode_weight`].
pub const WEIGHT_CHARACTERISTIC: Uuid = short_uuid(0xffb2);

/// SIG Weight Measurement characteristic (indicate).  Used when the vendor
/// characteristic is absent.
pub const WEIGHT_MEASUREMENT_CHARACTERISTIC: Uuid = short_uuid(0x2a9d);

/// SIG Battery Service.
pub const BATTERY_SERVICE: Uuid = short_uuid(0x180f);

/// SIG Battery Level characteristic (read), one byte in percent.
pub const BATTERY_LEVEL_CHARACTERISTIC: Uuid = short_uuid(0x2a19);

/// Length of a weight frame on [`WEIGHT_CHARACTERISTIC`].
pub const WEIGHT_FRAME_LEN: usize = 8;

/// Byte offset of the little-endian decigram value inside a weight frame.
pub const WEIGHT_VALUE_OFFSET: usize = 2;

// ── Discovery timing ──────────────────────────────────────────────────────────

/// A device not re-observed for this long is considered gone.
pub const DEFAULT_PRESENCE_WINDOW: Duration = Duration::from_secs(5);

/// Trailing debounce applied to full-snapshot emissions.
pub const DEFAULT_DEBOUNCE_DELAY: Duration = Duration::from_millis(100);

/// Period of the prune tick that runs independently of advertisements.
pub const DEFAULT_PRUNE_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on the wait for the adapter to report powered-on.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);

// ── Connection timing ─────────────────────────────────────────────────────────

/// BlueZ's `Device1.Connect` can block forever on an out-of-range device.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_GATT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(15);

/// Human-readable role of a characteristic the client knows about.
pub fn characteristic_name(uuid: &Uuid) -> Option<&'static str> {
    match *uuid {
        WEIGHT_CHARACTERISTIC => Some("Weight"),
        WEIGHT_MEASUREMENT_CHARACTERISTIC => Some("Weight Measurement"),
        BATTERY_LEVEL_CHARACTERISTIC => Some("Battery Level"),
        _ => None,
    }
}
