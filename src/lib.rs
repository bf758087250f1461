//! # scale-rs
//!
//! Async Rust library and terminal UI for BLE kitchen/body scales such as the
//! Gourmetmiles Smart Scale.  It discovers nearby peripherals, keeps a
//! deduplicated live list of them, connects to the one the operator picks and
//! streams weight and battery telemetry.
//!
//! ## Supported characteristics
//!
//! | UUID | Role | Access | Notes |
//! |---|---|---|---|
//! | `ffb2` | Weight (vendor) | notify | 8-byte frame, u16 LE decigrams at offset 2 |
//! | `2a9d` | Weight Measurement (SIG) | indicate | used only when `ffb2` is absent |
//! | `180f` / `2a19` | Battery Level (SIG) | read | 1 byte, percent |
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use scale_rs::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let adapter = Arc::new(BtleplugAdapter::new().await?);
//!     let discovery = DiscoverySession::new(Arc::clone(&adapter), DiscoveryConfig::default());
//!     let mut found = discovery.subscribe();
//!     discovery.start().await?;
//!
//!     // Connect to the first device that shows up.
//!     let device = loop {
//!         if let Some(DiscoveryEvent::Discovered(d)) = found.recv().await {
//!             break d;
//!         }
//!     };
//!     discovery.stop().await;
//!
//!     let scale = ConnectionSession::new(adapter, ConnectionConfig::default());
//!     let mut events = scale.subscribe();
//!     scale.connect(&device).await?;
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             ScaleEvent::Weight(w) => println!("{:.1} g", w.grams),
//!             ScaleEvent::Disconnected => break,
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Using as a library dependency
//!
//! ```toml
//! [dependencies]
//! # Full build (includes the ratatui TUI feature):
//! scale-rs = "0.1"
//!
//! # Library only, skips ratatui / crossterm compilation:
//! scale-rs = { version = "0.1", default-features = false }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the most commonly needed types |
//! | [`discovery`] | Scan lifecycle, presence pipeline, debounced snapshots |
//! | [`connection`] | Connect / weight stream / battery read state machine |
//! | [`identity`] | Advertisement → stable device identity key |
//! | [`manufacturer`] | Company identifier → manufacturer name |
//! | [`tracker`] | Visible-device set with first/last seen and expiry |
//! | [`debounce`] | Trailing debounce as a deadline state machine |
//! | [`adapter`] | The BLE stack seam and its btleplug implementation |
//! | [`sim`] | In-process simulated adapter (`--simulate`, tests) |
//! | [`events`] | Typed publish/subscribe with drop-to-unsubscribe |
//! | [`types`] | Data model and event types |
//! | [`protocol`] | GATT UUIDs and timing defaults |
//! | [`parse`] | Weight and battery payload decoders |
//! | [`error`] | [`error::ScaleError`] |
//! | [`cli`], [`logging`] | Flags, environment rules and logger setup for the binaries |

pub mod adapter;
pub mod cli;
pub mod connection;
pub mod debounce;
pub mod discovery;
pub mod error;
pub mod events;
pub mod identity;
pub mod logging;
pub mod manufacturer;
pub mod parse;
pub mod protocol;
pub mod sim;
pub mod tracker;
pub mod types;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
pub mod prelude {
    // ── Sessions ──────────────────────────────────────────────────────────────
    pub use crate::connection::{ConnectionConfig, ConnectionSession};
    pub use crate::discovery::{DiscoveryConfig, DiscoverySession};
    pub use crate::events::Subscription;

    // ── Adapters ──────────────────────────────────────────────────────────────
    pub use crate::adapter::{Adapter, BtleplugAdapter, GattPeripheral};
    pub use crate::sim::{SimAdapter, SimPeripheral};

    // ── Events and data types ─────────────────────────────────────────────────
    pub use crate::error::ScaleError;
    pub use crate::identity::IdentityKey;
    pub use crate::manufacturer::manufacturer_name;
    pub use crate::types::{
        Advertisement, BatteryReading, ConnectionState, ConnectionStatus, DiscoveryEvent,
        ScaleEvent, ScanState, TrackedDevice, WeightReading,
    };
}
