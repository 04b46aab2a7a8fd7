//! Push-notification channel (STOMP over websocket)

pub mod frames;
pub mod socket;
pub mod stomp;

pub use socket::{CloseHandler, NotificationSocket, StateHandler};
