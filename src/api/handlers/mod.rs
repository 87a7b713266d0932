//! API handlers and the middleware they depend on.
//!
//! `auth` decides who is calling, `tenant` which organization the call belongs
//! to and what the caller may do there, and `audit` records what happened.

pub mod audit;
pub mod auth;
pub mod health;
pub(crate) mod persist;
pub mod tenant;

pub use self::health::health;
