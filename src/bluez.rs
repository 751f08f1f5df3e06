//! The BlueZ side of a tablet.
//!
//! The daemon refers to the `org.bluez.Device1` object of each tablet through the device's
//! `BlueZDevice` property. [`BluezDevice`] binds that object on the system bus to read the hardware
//! address and name, and to follow the connection state.

use core::fmt;

use zbus::zvariant::OwnedObjectPath;

use crate::{
    address::Address,
    observer::Observers,
    transport::{BusScope, Event, RemoteObject, Target},
    Error, Result, Session, BLUEZ_DEVICE_INTERFACE, BLUEZ_SERVICE,
};

/// Changes republished by a [`BluezDevice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum BluezChange {
    /// [`BluezDevice::is_connected`] changed.
    Connected,
}

/// A reference to the BlueZ object of one physical device.
pub struct BluezDevice {
    object: RemoteObject,
    changes: Observers<BluezChange>,
}

impl BluezDevice {
    pub async fn bind(session: &Session, path: OwnedObjectPath) -> Result<Self> {
        let target = Target::new(
            BusScope::System,
            BLUEZ_SERVICE,
            BLUEZ_DEVICE_INTERFACE,
            path,
        );
        Ok(Self {
            object: RemoteObject::bind(session, target).await?,
            changes: Observers::new(),
        })
    }

    pub fn path(&self) -> &OwnedObjectPath {
        self.object.path()
    }

    /// Returns the hardware [`Address`] of the device.
    pub fn address(&self) -> Result<Address> {
        let string = self
            .object
            .property::<String>("Address")
            .ok_or_else(|| Error::from(format!("{} has no address", self.path().as_str())))?;
        string.parse().map_err(Error::from)
    }

    /// Returns the name the device advertises, if known.
    pub fn name(&self) -> Option<String> {
        self.object.property("Name")
    }

    /// Returns whether BlueZ is currently connected to the device.
    pub fn is_connected(&self) -> bool {
        self.object.property("Connected").unwrap_or(false)
    }

    pub fn changes(&self) -> &Observers<BluezChange> {
        &self.changes
    }

    pub(crate) fn handle(&self, event: &Event) {
        if event.touches("Connected") {
            log::debug!("{}: connected is now {}", self.path().as_str(), self.is_connected());
            self.changes.notify(&BluezChange::Connected);
        }
    }

    pub fn terminate(&self) {
        self.changes.clear();
        self.object.terminate();
    }
}

impl fmt::Debug for BluezDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BluezDevice")
            .field("path", self.path())
            .finish()
    }
}
