//! Deduplication key for repeated advertisements from one peripheral.
//!
//! A peripheral advertises many times per second, and on some platforms the
//! hardware address is redacted.  [`identify`] folds every advertisement into
//! an [`IdentityKey`]:
//!
//! 1. With a usable address: `addr:<address>:<mfg tag>`.  The manufacturer
//!    tag separates co-located devices that rotate through the same random
//!    address space.
//! 2. Without one: `name:<name>|svc:<sorted services>|<mfg tag>`.  This is a
//!    heuristic.  Two anonymous devices with the same name, services and
//!    manufacturer collapse into one key, and so do all devices that advertise
//!    nothing at all.

use std::fmt;

use crate::types::Advertisement;

/// Stable logical identity of a physical peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Short fingerprint of the manufacturer data: the company ID from the first
/// two bytes, not the payload (which usually changes with every frame).
pub fn manufacturer_tag(adv: &Advertisement) -> String {
    match adv.company_id() {
        Some(id) => format!("mfg-{id:04x}"),
        None => "no-mfg".to_owned(),
    }
}

/// Compute the identity key of the peripheral that sent `adv`.  Pure.
pub fn identify(adv: &Advertisement) -> IdentityKey {
    let tag = manufacturer_tag(adv);

    if let Some(address) = adv.usable_address() {
        return IdentityKey(format!("addr:{}:{tag}", address.to_lowercase()));
    }

    let mut services: Vec<String> = adv
        .services
        .iter()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect();
    services.sort();
    services.dedup();

    IdentityKey(format!(
        "name:{}|svc:{}|{tag}",
        adv.display_name(),
        services.join(",")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_address(addr: &str, mfg: Option<Vec<u8>>) -> Advertisement {
        Advertisement {
            address: Some(addr.into()),
            manufacturer_data: mfg,
            ..Default::default()
        }
    }

    #[test]
    fn stable_address_gives_stable_key() {
        let mut adv = with_address("C8:47:8C:00:11:22", Some(vec![0xc0, 0x06, 1, 2, 3]));
        let first = identify(&adv);
        for payload in [vec![0xc0, 0x06, 9, 9], vec![0xc0, 0x06, 4, 5, 6, 7]] {
            adv.manufacturer_data = Some(payload);
            adv.rssi = Some(-40);
            assert_eq!(identify(&adv), first);
        }
        assert_eq!(first.as_str(), "addr:c8:47:8c:00:11:22:mfg-06c0");
    }

    #[test]
    fn address_case_does_not_matter() {
        let upper = identify(&with_address("AA:BB:CC:DD:EE:FF", None));
        let lower = identify(&with_address("aa:bb:cc:dd:ee:ff", None));
        assert_eq!(upper, lower);
    }

    #[test]
    fn manufacturer_separates_devices_sharing_an_address() {
        let a = identify(&with_address("11:22:33:44:55:66", Some(vec![0x4c, 0x00])));
        let b = identify(&with_address("11:22:33:44:55:66", Some(vec![0x06, 0x00])));
        assert_ne!(a, b);
    }

    #[test]
    fn name_and_service_fallback_ignores_service_order() {
        let a = Advertisement {
            address: Some(String::new()),
            local_name: Some("Scale".into()),
            services: vec!["FFB0".into(), "180f".into()],
            ..Default::default()
        };
        let b = Advertisement {
            services: vec!["180F".into(), "ffb0".into()],
            ..a.clone()
        };
        assert_eq!(identify(&a), identify(&b));
        assert_eq!(identify(&a).as_str(), "name:Scale|svc:180f,ffb0|no-mfg");
    }

    #[test]
    fn different_names_without_address_do_not_collide() {
        let a = Advertisement {
            local_name: Some("Scale A".into()),
            ..Default::default()
        };
        let b = Advertisement {
            local_name: Some("Scale B".into()),
            ..Default::default()
        };
        assert_ne!(identify(&a), identify(&b));
    }

    #[test]
    fn empty_advertisements_collapse_to_one_key() {
        // Known limitation: nothing to tell these apart.
        let a = Advertisement {
            peripheral_id: "one".into(),
            rssi: Some(-80),
            ..Default::default()
        };
        let b = Advertisement {
            peripheral_id: "two".into(),
            tx_power: Some(4),
            ..Default::default()
        };
        assert_eq!(identify(&a), identify(&b));
        assert_eq!(identify(&a).as_str(), "name:(no name)|svc:|no-mfg");
    }
}
