//! Command acknowledgement tracking

pub mod tracker;
