use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChargerEvent {
    Attached,
    Detached,
    Completed,
    ChargingOk,
    ChargingLow,
}

/// Battery states ordered from worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BatteryLevel {
    Unknown,
    TooLow,
    Critical,
    Low,
    Ok,
}

/// Most recent power notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerState {
    pub charger: Option<ChargerEvent>,
    pub battery: BatteryLevel,
}

impl Default for PowerState {
    fn default() -> Self {
        Self {
            charger: None,
            battery: BatteryLevel::Ok,
        }
    }
}

impl PowerState {
    pub fn on_charger(&mut self, event: ChargerEvent) {
        self.charger = Some(event);
    }

    pub fn on_battery(&mut self, level: BatteryLevel) {
        self.battery = level;
    }

    pub fn charger_attached(&self) -> bool {
        matches!(
            self.charger,
            Some(ChargerEvent::Attached)
                | Some(ChargerEvent::Completed)
                | Some(ChargerEvent::ChargingOk)
                | Some(ChargerEvent::ChargingLow)
        )
    }
}

/// Decides whether a new write-class operation may start.
pub trait PowerPolicy: Send {
    fn is_write_safe(&self, state: &PowerState) -> bool;
}

/// Never vetoes.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysSafe;

impl PowerPolicy for AlwaysSafe {
    fn is_write_safe(&self, _state: &PowerState) -> bool {
        true
    }
}

/// Refuses writes below `floor` unless a charger is connected.
#[derive(Debug, Clone, Copy)]
pub struct MinimumBattery {
    pub floor: BatteryLevel,
}

impl PowerPolicy for MinimumBattery {
    fn is_write_safe(&self, state: &PowerState) -> bool {
        state.charger_attached() || state.battery >= self.floor
    }
}
