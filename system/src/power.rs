//! Host battery probe through the Linux power-supply class.

use std::fs;
use std::path::Path;

use rafs::{BatteryLevel, ChargerEvent, PowerState};

use crate::SystemError;

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

fn level_for_capacity(percent: u32) -> BatteryLevel {
    match percent {
        0..=4 => BatteryLevel::TooLow,
        5..=9 => BatteryLevel::Critical,
        10..=19 => BatteryLevel::Low,
        _ => BatteryLevel::Ok,
    }
}

/// Read the first battery under `sysfs` (normally
/// `/sys/class/power_supply`). `None` when the host has no battery.
pub fn probe_host_power(sysfs: &Path) -> Result<Option<PowerState>, SystemError> {
    if !sysfs.is_dir() {
        return Ok(None);
    }

    let mut supplies: Vec<_> = fs::read_dir(sysfs)?.filter_map(|e| e.ok()).map(|e| e.path()).collect();
    supplies.sort();

    for supply in supplies {
        if read_trimmed(&supply.join("type")).as_deref() != Some("Battery") {
            continue;
        }

        let battery = read_trimmed(&supply.join("capacity"))
            .and_then(|s| s.parse::<u32>().ok())
            .map_or(BatteryLevel::Unknown, level_for_capacity);
        let charger = match read_trimmed(&supply.join("status")).as_deref() {
            Some("Charging") => Some(ChargerEvent::Attached),
            Some("Full") => Some(ChargerEvent::Completed),
            Some("Discharging") => Some(ChargerEvent::Detached),
            _ => None,
        };

        tracing::debug!("Battery {}: {:?}, {:?}", supply.display(), battery, charger);
        return Ok(Some(PowerState { charger, battery }));
    }
    Ok(None)
}
