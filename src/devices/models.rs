//! Interior unit model and control vector

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Humidity sent with a command when the caller gives no explicit target.
/// Some devices report sentinel values like 126 that the control endpoint
/// rejects, so the last known humidity is never reused implicitly.
pub const DEFAULT_COMMAND_HUMIDITY: i32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Power {
    On,
    Off,
}

/// Operating mode. The vendor occasionally emits values outside the
/// documented set; those decode to `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperatingMode {
    Auto,
    Cooling,
    Dry,
    Fan,
    Heating,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FanSpeed {
    Lv1,
    Lv2,
    Lv3,
    Lv4,
    Lv5,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FanSwing {
    Off,
    Vertical,
    Horizontal,
    Both,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleType {
    ScheduleDisabled,
    OffTimerEnabled,
    OnTimerEnabled,
    OnOffTimerEnabled,
    WeeklyTimerEnabled,
    HolidayModeEnabled,
}

/// The complete user-controllable state of one interior unit.
///
/// Commands always carry the whole vector, so this type is treated as a
/// value: merges produce a new `ControlState`, never mutate one in place.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlState {
    pub rac_id: i64,
    pub power: Power,
    pub mode: OperatingMode,
    pub requested_temperature: f64,
    pub humidity: i32,
    pub fan_speed: FanSpeed,
    pub fan_swing: FanSwing,
}

impl ControlState {
    /// Merge a partial update onto this state, producing the full control
    /// vector to put on the wire. Humidity falls back to
    /// [`DEFAULT_COMMAND_HUMIDITY`] rather than the stored value, which may
    /// be an out-of-range sentinel.
    pub fn apply(&self, update: &ControlUpdate) -> ControlState {
        ControlState {
            rac_id: self.rac_id,
            power: update.power.unwrap_or(self.power),
            mode: update.mode.unwrap_or(self.mode),
            requested_temperature: update
                .requested_temperature
                .unwrap_or(self.requested_temperature),
            humidity: update.humidity.unwrap_or(DEFAULT_COMMAND_HUMIDITY),
            fan_speed: update.fan_speed.unwrap_or(self.fan_speed),
            fan_swing: update.fan_swing.unwrap_or(self.fan_swing),
        }
    }
}

/// A partial control change as issued by the caller. Unset fields keep the
/// current value (humidity excepted, see [`ControlState::apply`]).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControlUpdate {
    pub power: Option<Power>,
    pub mode: Option<OperatingMode>,
    pub requested_temperature: Option<f64>,
    pub humidity: Option<i32>,
    pub fan_speed: Option<FanSpeed>,
    pub fan_swing: Option<FanSwing>,
}

/// Last known state of one interior unit: read-only telemetry plus the
/// confirmed control vector.
#[derive(Debug, Clone, PartialEq)]
pub struct InteriorUnit {
    pub id: i64,
    pub name: String,
    pub room_temperature: f64,
    pub relative_temperature: f64,
    pub updated_at: DateTime<Utc>,
    pub online: bool,
    pub online_updated_at: DateTime<Utc>,
    pub model: String,
    pub model_type_id: String,
    pub serial_number: String,
    pub vendor_thing_id: String,
    pub schedule_type: ScheduleType,
    pub control: ControlState,
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn control_state(rac_id: i64) -> ControlState {
        ControlState {
            rac_id,
            power: Power::On,
            mode: OperatingMode::Cooling,
            requested_temperature: 22.0,
            humidity: 126, // out-of-range sentinel as reported by some devices
            fan_speed: FanSpeed::Auto,
            fan_swing: FanSwing::Off,
        }
    }

    #[test]
    fn test_apply_keeps_unset_fields() {
        let base = control_state(7);
        let next = base.apply(&ControlUpdate {
            requested_temperature: Some(19.5),
            ..Default::default()
        });

        assert_eq!(next.power, Power::On);
        assert_eq!(next.mode, OperatingMode::Cooling);
        assert_eq!(next.requested_temperature, 19.5);
        assert_eq!(next.fan_speed, FanSpeed::Auto);
        // the original is untouched
        assert_eq!(base.requested_temperature, 22.0);
    }

    #[test]
    fn test_apply_substitutes_default_humidity() {
        let base = control_state(7);

        let next = base.apply(&ControlUpdate::default());
        assert_eq!(next.humidity, DEFAULT_COMMAND_HUMIDITY);

        let explicit = base.apply(&ControlUpdate {
            humidity: Some(60),
            ..Default::default()
        });
        assert_eq!(explicit.humidity, 60);
    }

    #[test]
    fn test_enum_wire_names() {
        assert_eq!(serde_json::to_string(&FanSpeed::Lv3).unwrap(), "\"LV3\"");
        assert_eq!(serde_json::to_string(&FanSwing::Both).unwrap(), "\"BOTH\"");
        assert_eq!(
            serde_json::to_string(&OperatingMode::Cooling).unwrap(),
            "\"COOLING\""
        );
        assert_eq!(
            serde_json::from_str::<ScheduleType>("\"OFF_TIMER_ENABLED\"").unwrap(),
            ScheduleType::OffTimerEnabled
        );
    }

    #[test]
    fn test_undocumented_mode_decodes_to_unknown() {
        assert_eq!(
            serde_json::from_str::<OperatingMode>("\"DRY_COOL\"").unwrap(),
            OperatingMode::Unknown
        );
    }
}
