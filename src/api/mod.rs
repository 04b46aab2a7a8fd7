//! REST API bindings

pub mod http;
pub mod iam;
pub mod rac;
