//! Field-by-field diff between two interior unit snapshots

use std::fmt;

use chrono::{DateTime, Utc};

use crate::devices::models::{FanSpeed, FanSwing, InteriorUnit, OperatingMode, Power};

fn pair<T: PartialEq + Clone>(old: &T, new: &T) -> Option<(T, T)> {
    if old != new {
        Some((old.clone(), new.clone()))
    } else {
        None
    }
}

/// The per-field (old, new) pairs produced by one state update. `None`
/// means the field did not change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitChanges {
    pub name: Option<(String, String)>,
    pub room_temperature: Option<(f64, f64)>,
    pub relative_temperature: Option<(f64, f64)>,
    pub updated_at: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub online: Option<(bool, bool)>,
    pub online_updated_at: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub model: Option<(String, String)>,
    pub model_type_id: Option<(String, String)>,
    pub power: Option<(Power, Power)>,
    pub operating_mode: Option<(OperatingMode, OperatingMode)>,
    pub requested_temperature: Option<(f64, f64)>,
    pub humidity: Option<(i32, i32)>,
    pub fan_speed: Option<(FanSpeed, FanSpeed)>,
    pub fan_swing: Option<(FanSwing, FanSwing)>,
}

impl UnitChanges {
    /// Compare two snapshots of the same unit field by field.
    pub fn diff(old: &InteriorUnit, new: &InteriorUnit) -> UnitChanges {
        UnitChanges {
            name: pair(&old.name, &new.name),
            room_temperature: pair(&old.room_temperature, &new.room_temperature),
            relative_temperature: pair(&old.relative_temperature, &new.relative_temperature),
            updated_at: pair(&old.updated_at, &new.updated_at),
            online: pair(&old.online, &new.online),
            online_updated_at: pair(&old.online_updated_at, &new.online_updated_at),
            model: pair(&old.model, &new.model),
            model_type_id: pair(&old.model_type_id, &new.model_type_id),
            power: pair(&old.control.power, &new.control.power),
            operating_mode: pair(&old.control.mode, &new.control.mode),
            requested_temperature: pair(
                &old.control.requested_temperature,
                &new.control.requested_temperature,
            ),
            humidity: pair(&old.control.humidity, &new.control.humidity),
            fan_speed: pair(&old.control.fan_speed, &new.control.fan_speed),
            fan_swing: pair(&old.control.fan_swing, &new.control.fan_swing),
        }
    }

    pub fn has_changes(&self) -> bool {
        self.name.is_some()
            || self.room_temperature.is_some()
            || self.relative_temperature.is_some()
            || self.updated_at.is_some()
            || self.online.is_some()
            || self.online_updated_at.is_some()
            || self.model.is_some()
            || self.model_type_id.is_some()
            || self.power.is_some()
            || self.operating_mode.is_some()
            || self.requested_temperature.is_some()
            || self.humidity.is_some()
            || self.fan_speed.is_some()
            || self.fan_swing.is_some()
    }
}

impl fmt::Display for UnitChanges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = Vec::new();

        fn push<T: fmt::Debug>(parts: &mut Vec<String>, field: &str, change: &Option<(T, T)>) {
            if let Some((old, new)) = change {
                parts.push(format!("{}={:?}->{:?}", field, old, new));
            }
        }

        push(&mut parts, "name", &self.name);
        push(&mut parts, "room_temperature", &self.room_temperature);
        push(&mut parts, "relative_temperature", &self.relative_temperature);
        push(&mut parts, "updated_at", &self.updated_at);
        push(&mut parts, "online", &self.online);
        push(&mut parts, "online_updated_at", &self.online_updated_at);
        push(&mut parts, "model", &self.model);
        push(&mut parts, "model_type_id", &self.model_type_id);
        push(&mut parts, "power", &self.power);
        push(&mut parts, "operating_mode", &self.operating_mode);
        push(&mut parts, "requested_temperature", &self.requested_temperature);
        push(&mut parts, "humidity", &self.humidity);
        push(&mut parts, "fan_speed", &self.fan_speed);
        push(&mut parts, "fan_swing", &self.fan_swing);

        write!(f, "UnitChanges({})", parts.join(", "))
    }
}
