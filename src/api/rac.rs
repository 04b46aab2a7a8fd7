//! RAC endpoints: device list, control commands, command status, refresh

use std::collections::HashMap;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::api::http::RestClient;
use crate::devices::models::{
    ControlState, ControlUpdate, FanSpeed, FanSwing, InteriorUnit, OperatingMode, Power,
    ScheduleType,
};
use crate::errors::{Error, Result};
use crate::utils::timestamp_millis;

/// Identifies one accepted command for status polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRef {
    pub command_id: String,
    pub thing_id: String,
}

/// Server-side state of an accepted command. `Done` is the only terminal
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommandState {
    Sending,
    Incomplete,
    Done,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandStatusEntry {
    command_id: String,
    status: CommandState,
}

/// Wire shape of one device in the REST idu-list.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnitRest {
    id: i64,
    name: String,
    room_temperature: f64,
    relative_temperature: f64,
    #[serde(with = "timestamp_millis")]
    updated_at: chrono::DateTime<chrono::Utc>,
    online: bool,
    #[serde(with = "timestamp_millis")]
    last_online_updated_at: chrono::DateTime<chrono::Utc>,
    model: String,
    rac_type_id: i64,
    serial_number: String,
    vendor_thing_id: String,
    schedule_type: ScheduleType,
    power: Power,
    mode: OperatingMode,
    idu_temperature: f64,
    humidity: i32,
    fan_speed: FanSpeed,
    fan_swing: FanSwing,
}

impl UnitRest {
    fn into_unit(self) -> InteriorUnit {
        InteriorUnit {
            id: self.id,
            name: self.name,
            room_temperature: self.room_temperature,
            relative_temperature: self.relative_temperature,
            updated_at: self.updated_at,
            online: self.online,
            online_updated_at: self.last_online_updated_at,
            model: self.model,
            model_type_id: self.rac_type_id.to_string(),
            serial_number: self.serial_number,
            vendor_thing_id: self.vendor_thing_id,
            schedule_type: self.schedule_type,
            control: ControlState {
                rac_id: self.id,
                power: self.power,
                mode: self.mode,
                requested_temperature: self.idu_temperature,
                humidity: self.humidity,
                fan_speed: self.fan_speed,
                fan_swing: self.fan_swing,
            },
        }
    }
}

/// Wire shape of the general control command body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeneralControlCommand {
    id: i64,
    power: Power,
    mode: OperatingMode,
    idu_temperature: f64,
    humidity: i32,
    fan_speed: FanSpeed,
    fan_swing: FanSwing,
}

impl From<&ControlState> for GeneralControlCommand {
    fn from(control: &ControlState) -> Self {
        Self {
            id: control.rac_id,
            power: control.power,
            mode: control.mode,
            idu_temperature: control.requested_temperature,
            humidity: control.humidity,
            fan_speed: control.fan_speed,
            fan_swing: control.fan_swing,
        }
    }
}

/// Result of a bulk power command.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PowerAllResponse {
    pub all_succeeded: bool,
    pub result_set: Vec<PowerResult>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PowerResult {
    pub rac_id: i64,
    pub success: bool,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_code: Option<i64>,
    #[serde(default)]
    pub command_response: Option<CommandRef>,
}

/// Fetch the full interior unit list for a family.
pub async fn get_interior_units(
    rest: &RestClient,
    token: &str,
    family_id: i64,
) -> Result<Vec<InteriorUnit>> {
    let response = rest
        .request::<()>(
            Method::GET,
            &format!("/rac/ownership/groups/{}/idu-list", family_id),
            Some(token),
            &[],
            None,
            &[200],
        )
        .await?;

    let units: Vec<UnitRest> = response.json()?;
    Ok(units.into_iter().map(UnitRest::into_unit).collect())
}

/// Fetch the status of a batch of commands in one request.
pub async fn get_commands_state(
    rest: &RestClient,
    token: &str,
    commands: &[CommandRef],
) -> Result<HashMap<String, CommandState>> {
    debug!("Fetch status for {} commands", commands.len());
    let response = rest
        .request(
            Method::POST,
            "/rac/status/command",
            Some(token),
            &[],
            Some(commands),
            &[200],
        )
        .await?;

    let entries: Vec<CommandStatusEntry> = response.json()?;
    Ok(entries
        .into_iter()
        .map(|e| (e.command_id, e.status))
        .collect())
}

/// Send a control command (the remote-control equivalent). The server
/// accepts it asynchronously; poll with [`get_commands_state`] until DONE.
///
/// HTTP 429 means a previous command is still in progress and maps to
/// `TooManyRequests`.
pub async fn send_command(
    rest: &RestClient,
    token: &str,
    family_id: i64,
    command: &ControlState,
) -> Result<CommandRef> {
    let body = GeneralControlCommand::from(command);
    info!("Configure interior unit {} (family {})", command.rac_id, family_id);
    let response = rest
        .request(
            Method::PUT,
            &format!(
                "/rac/basic-idu-control/general-control-command/{}?familyId={}",
                command.rac_id, family_id
            ),
            Some(token),
            &[],
            Some(&body),
            &[200, 429],
        )
        .await?;

    if response.status == 429 {
        let vendor = serde_json::from_str(&response.body)
            .map_err(|e| Error::Parse(format!("malformed 429 body: {}", e)))?;
        return Err(Error::TooManyRequests(vendor));
    }

    response.json()
}

/// Ask the backend to push fresh state for one unit over the notification
/// channel.
pub async fn request_refresh(
    rest: &RestClient,
    token: &str,
    rac_id: i64,
    family_id: i64,
) -> Result<()> {
    debug!("Request state refresh for unit {}", rac_id);
    rest.request::<()>(
        Method::PUT,
        &format!("/rac/status/{}?familyId={}", rac_id, family_id),
        Some(token),
        &[],
        None,
        &[200],
    )
    .await?;
    Ok(())
}

/// Switch every given unit on or off in one request. The backend answers
/// 207 when only part of the fleet accepted the command.
pub async fn set_power_all(
    rest: &RestClient,
    token: &str,
    family_id: i64,
    power: Power,
    units: &[ControlState],
) -> Result<PowerAllResponse> {
    let action = match power {
        Power::On => "start",
        Power::Off => "stop",
    };
    let update = ControlUpdate {
        power: Some(power),
        ..Default::default()
    };
    let body: Vec<GeneralControlCommand> = units
        .iter()
        .map(|control| GeneralControlCommand::from(&control.apply(&update)))
        .collect();

    info!("Set power {:?} on {} units", power, body.len());
    let response = rest
        .request(
            Method::PUT,
            &format!("/rac/manage-idu/groups/{}/idu/{}", family_id, action),
            Some(token),
            &[],
            Some(&body),
            &[200, 207],
        )
        .await?;

    response.json()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_state_wire_names() {
        assert_eq!(
            serde_json::from_str::<CommandState>("\"SENDING\"").unwrap(),
            CommandState::Sending
        );
        assert_eq!(
            serde_json::from_str::<CommandState>("\"DONE\"").unwrap(),
            CommandState::Done
        );
    }

    #[test]
    fn test_control_command_wire_shape() {
        let control = ControlState {
            rac_id: 123,
            power: Power::Off,
            mode: OperatingMode::Heating,
            requested_temperature: 21.5,
            humidity: 50,
            fan_speed: FanSpeed::Lv2,
            fan_swing: FanSwing::Vertical,
        };
        let body = serde_json::to_value(GeneralControlCommand::from(&control)).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "id": 123,
                "power": "OFF",
                "mode": "HEATING",
                "iduTemperature": 21.5,
                "humidity": 50,
                "fanSpeed": "LV2",
                "fanSwing": "VERTICAL",
            })
        );
    }

    #[test]
    fn test_unit_rest_decodes_strictly() {
        // missing `online` must fail loudly instead of admitting a partial unit
        let incomplete = serde_json::json!({
            "id": 1, "name": "Living room", "roomTemperature": 21.0,
            "relativeTemperature": 0.5, "updatedAt": 1700000000000i64,
        });
        assert!(serde_json::from_value::<UnitRest>(incomplete).is_err());
    }
}
