//! Authentication: token parsing and renewal

pub mod manager;
pub mod token;

pub use manager::{AuthManager, TokenSource};
pub use token::{BearerToken, TokenPair};
