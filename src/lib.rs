//! Client-side proxies for the tuhi daemon, and a REST adapter on top of them.
//!
//! The [`Manager`] and [`Device`] types mirror the daemon's objects on the session bus and keep
//! their state current from the daemon's property changes and signals, which are delivered on a
//! single [`EventLoop`](event_loop::EventLoop) thread. [`rest::Tuhi`] wraps all of this into the
//! operations a REST API exposes.

pub mod address;
pub mod bluez;
pub mod config;
pub mod device;
mod error;
pub mod event_loop;
pub mod manager;
pub mod observer;
pub mod rest;
pub mod transport;

pub use device::Device;
pub use error::{Error, Result};
pub use manager::Manager;

use std::sync::Arc;

use event_loop::LoopHandle;
use transport::{dbus::DBusTransport, BusScope, Transport};

/// Well-known bus name of the tuhi daemon.
pub const TUHI_SERVICE: &str = "org.freedesktop.tuhi1";
/// Interface of the daemon's singleton manager object.
pub const MANAGER_INTERFACE: &str = "org.freedesktop.tuhi1.Manager";
/// Interface of the daemon's per-device objects.
pub const DEVICE_INTERFACE: &str = "org.freedesktop.tuhi1.Device";
/// Object path of the manager.
pub const ROOT_PATH: &str = "/org/freedesktop/tuhi1";
pub const BLUEZ_SERVICE: &str = "org.bluez";
pub const BLUEZ_DEVICE_INTERFACE: &str = "org.bluez.Device1";

/// The drawing file format understood by this client, passed to `GetJSONData`.
pub const FILE_FORMAT_VERSION: u32 = 1;

/// A cloneable handle to the buses.
///
/// Every remote object is bound through a [`Session`]; objects bound through clones of the same
/// session share one connection per bus.
#[derive(Clone)]
pub struct Session {
    transport: Arc<dyn Transport>,
    daemon_bus: BusScope,
}

impl Session {
    /// Creates a session on top of an arbitrary [`Transport`].
    pub fn new(transport: impl Transport) -> Self {
        Self {
            transport: Arc::new(transport),
            daemon_bus: BusScope::Session,
        }
    }

    /// Creates a session using D-Bus, delivering events to the loop behind `events`.
    pub fn dbus(events: LoopHandle) -> Self {
        Self::new(DBusTransport::new(events))
    }

    /// Looks for the daemon on `scope` instead of the session bus.
    pub fn with_daemon_bus(mut self, scope: BusScope) -> Self {
        self.daemon_bus = scope;
        self
    }

    /// Returns the bus the daemon is expected on.
    pub fn daemon_bus(&self) -> BusScope {
        self.daemon_bus
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        &*self.transport
    }
}
