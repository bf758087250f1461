//! Binary decoders for scale GATT payloads.
//!
//! All public functions in this module are pure apart from stamping the
//! capture time, and are safe to call from any async or sync context.
//!
//! | Function | Characteristic | Format |
//! |---|---|---|
//! | [`decode_weight`] | `ffb2` / `2a9d` | 8 bytes, u16 LE decigrams at offset 2 |
//! | [`decode_battery`] | `2a19` | 1 byte, percent |

use log::debug;

use crate::protocol::{WEIGHT_FRAME_LEN, WEIGHT_VALUE_OFFSET};
use crate::types::{BatteryReading, WeightReading};

/// Milliseconds since the Unix epoch, as a float.
pub fn now_ms() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
        * 1000.0
}

// ── Weight ───────────────────────────────────────────────────────────────────

/// Decode a weight notification.
///
/// ```text
/// [.. ..  LO HI  .. .. .. ..]   value = u16::from_le_bytes([LO, HI])
///  0  1   2  3   4  5  6  7     grams = value / 10
/// ```
///
/// Frames of any other length decode to `0 g` rather than failing: some
/// scales emit short status frames on the same characteristic, and the
/// display simply shows zero for those.
pub fn decode_weight(data: &[u8]) -> WeightReading {
    let grams = if data.len() == WEIGHT_FRAME_LEN {
        let raw = u16::from_le_bytes([data[WEIGHT_VALUE_OFFSET], data[WEIGHT_VALUE_OFFSET + 1]]);
        raw as f64 / 10.0
    } else {
        debug!(
            "weight frame of {} bytes (expected {WEIGHT_FRAME_LEN}): {:02x?}",
            data.len(),
            data
        );
        0.0
    };

    WeightReading {
        grams,
        kg: grams / 1000.0,
        raw: data.to_vec(),
        timestamp: now_ms(),
    }
}

/// Drops weight notifications whose payload is byte-identical to the one
/// immediately before it.  Scales repeat the same frame several times per
/// second while the load is stable.
#[derive(Debug, Default)]
pub struct WeightDeduper {
    last: Option<Vec<u8>>,
}

impl WeightDeduper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `data` unless it repeats the previous payload.
    pub fn accept(&mut self, data: &[u8]) -> Option<WeightReading> {
        if self.last.as_deref() == Some(data) {
            return None;
        }
        self.last = Some(data.to_vec());
        Some(decode_weight(data))
    }
}

// ── Battery ──────────────────────────────────────────────────────────────────

/// Decode a Battery Level read.  Returns `None` for an empty payload.
///
/// The level is passed through as-is; values above 100 are not clamped.
pub fn decode_battery(data: &[u8]) -> Option<BatteryReading> {
    let level = *data.first()?;
    Some(BatteryReading {
        level,
        raw: data.to_vec(),
        timestamp: now_ms(),
    })
}

// ── Tests ────────────────────────────────────────────────────────────────────
