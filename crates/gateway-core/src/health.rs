//! Provider health status as seen by the resilience layer.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Health status of a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Provider is healthy and accepting requests
    Healthy,
    /// Provider is serving but close to saturation or leaning on fallbacks
    Degraded,
    /// Provider is unhealthy and should not receive requests
    Unhealthy,
    /// Health status is unknown (e.g., never called)
    #[default]
    Unknown,
}

impl HealthStatus {
    /// Check if the provider should receive traffic
    #[must_use]
    pub fn should_route(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded | Self::Unknown)
    }

    /// Check if the status indicates a problem
    #[must_use]
    pub fn is_problematic(&self) -> bool {
        matches!(self, Self::Unhealthy)
    }

    /// Combine two observations, keeping the worse one
    #[must_use]
    pub fn worst(self, other: Self) -> Self {
        fn rank(status: HealthStatus) -> u8 {
            match status {
                HealthStatus::Unknown => 0,
                HealthStatus::Healthy => 1,
                HealthStatus::Degraded => 2,
                HealthStatus::Unhealthy => 3,
            }
        }
        if rank(other) > rank(self) {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}
