//! # Gateway Core
//!
//! Types shared between provider callers and the resilience engine:
//! - `GatewayError`, the error contract for every provider call
//! - `HealthStatus`, the per-provider health verdict

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod health;

pub use error::{GatewayError, GatewayResult};
pub use health::HealthStatus;
