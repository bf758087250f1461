//! Bluetooth SIG company identifiers → display names.
//!
//! Only a handful of companies that commonly show up next to a kitchen scale
//! are listed.  Everything else is shown by its hex identifier.

use crate::types::Advertisement;

/// Registered company name for `id`, if it is one we know.
pub fn company_name(id: u16) -> Option<&'static str> {
    let name = match id {
        0x0002 => "Intel Corp.",
        0x0006 => "Microsoft",
        0x000d => "Texas Instruments Inc.",
        0x000f => "Broadcom Corporation",
        0x001d => "Qualcomm",
        0x0030 => "ST Microelectronics",
        0x0046 => "MediaTek, Inc.",
        0x004c => "Apple, Inc.",
        0x0059 => "Nordic Semiconductor ASA",
        0x0075 => "Samsung Electronics Co. Ltd.",
        0x0087 => "Garmin International, Inc.",
        0x00e0 => "Google",
        0x0131 => "Cypress Semiconductor Corporation",
        0x0157 => "Anhui Huami Information Technology Co., Ltd.",
        0x0171 => "Amazon.com Services, Inc.",
        0x02e5 => "Espressif Incorporated",
        0x038f => "Xiaomi Inc.",
        0x0499 => "Ruuvi Innovations Ltd.",
        _ => return None,
    };
    Some(name)
}

/// Manufacturer of the device that sent `adv`, for display.
///
/// `"Unknown"` without manufacturer data, `"Unknown (0x06c0)"` for a company
/// identifier that is not in the table.
pub fn manufacturer_name(adv: &Advertisement) -> String {
    match adv.company_id() {
        None => "Unknown".to_owned(),
        Some(id) => match company_name(id) {
            Some(name) => name.to_owned(),
            None => format!("Unknown (0x{id:04x})"),
        },
    }
}
