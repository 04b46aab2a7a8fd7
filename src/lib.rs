//! Async client for the Hitachi AirCloud service.
//!
//! The service exposes two surfaces: a REST API for authentication and
//! device control, and a STOMP-over-websocket channel that pushes device
//! state. [`AirCloud`] wraps both behind one session:
//!
//! ```no_run
//! use aircloud::{AirCloud, ControlUpdate, OperatingMode};
//!
//! # async fn example() -> aircloud::Result<()> {
//! let session = AirCloud::new("user@example.com", "password");
//! session.connect().await?;
//!
//! for unit in session.interior_units().await {
//!     println!("{}: {} ({:?})", unit.id, unit.name, unit.control.power);
//! }
//!
//! session
//!     .send_command(
//!         42,
//!         ControlUpdate {
//!             mode: Some(OperatingMode::Heating),
//!             requested_temperature: Some(21.0),
//!             ..Default::default()
//!         },
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! Control commands are acknowledged asynchronously by the backend; the
//! session keeps at most one command in flight per unit and coalesces
//! anything queued behind it. Confirmed state comes back over the push
//! channel and is reported through the change listener.

pub mod api;
pub mod auth;
pub mod commands;
pub mod config;
pub mod devices;
pub mod errors;
pub mod notifications;
pub mod session;
pub(crate) mod utils;

pub use api::iam::{TemperatureUnit, UserProfile};
pub use api::rac::{CommandRef, CommandState, PowerAllResponse, PowerResult};
pub use commands::tracker::{AckState, CommandHandle, CommandTracker};
pub use config::{Config, ReconnectOptions, DEFAULT_API_HOST, DEFAULT_NOTIFICATION_HOST};
pub use devices::changes::UnitChanges;
pub use devices::models::{
    ControlState, ControlUpdate, FanSpeed, FanSwing, InteriorUnit, OperatingMode, Power,
    ScheduleType, DEFAULT_COMMAND_HUMIDITY,
};
pub use devices::store::{ChangeListener, ChangeSet, DeviceStore};
pub use errors::{Error, Result, VendorError};
pub use session::AirCloud;
pub use utils::BackoffOptions;
