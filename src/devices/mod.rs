//! Interior unit models, diffs and the device state store

pub mod changes;
pub mod models;
pub mod store;
