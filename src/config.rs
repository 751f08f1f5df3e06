//! Runtime settings of the REST adapter.

use std::{env, time::Duration};

use crate::transport::BusScope;

/// How long a search started through the REST API runs before it is stopped.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);

const DISCOVERY_TIMEOUT_VAR: &str = "TUHI_BRIDGE_DISCOVERY_TIMEOUT";
const BUS_VAR: &str = "TUHI_BRIDGE_BUS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Length of the discovery window opened by each search request.
    pub discovery_timeout: Duration,
    /// Bus the daemon is expected on.
    pub daemon_bus: BusScope,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            daemon_bus: BusScope::Session,
        }
    }
}

impl Settings {
    /// Returns the default settings, overridden by `TUHI_BRIDGE_DISCOVERY_TIMEOUT` (whole seconds)
    /// and `TUHI_BRIDGE_BUS` (`session` or `system`) where set.
    ///
    /// Malformed values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut settings = Self::default();

        if let Some(value) = lookup(DISCOVERY_TIMEOUT_VAR) {
            match value.trim().parse::<u64>() {
                Ok(secs) => settings.discovery_timeout = Duration::from_secs(secs),
                Err(e) => log::warn!("ignoring {}={:?}: {}", DISCOVERY_TIMEOUT_VAR, value, e),
            }
        }

        if let Some(value) = lookup(BUS_VAR) {
            match value.trim() {
                "session" => settings.daemon_bus = BusScope::Session,
                "system" => settings.daemon_bus = BusScope::System,
                other => log::warn!("ignoring {}={:?}: unknown bus", BUS_VAR, other),
            }
        }

        settings
    }
}
