//! Tablets known to the daemon.

use core::fmt;
use std::{
    io,
    os::fd::{AsRawFd, BorrowedFd},
    sync::{Arc, Mutex, Weak},
};

use serde::{Serialize, Serializer};
use zbus::zvariant::{ObjectPath, OwnedObjectPath};

use crate::{
    address::Address,
    bluez::{BluezChange, BluezDevice},
    manager::{ManagerEvent, WeakManager},
    observer::{lock, Observers, SubscriptionId},
    transport::{decode, Event, Method, RemoteObject, Target},
    Error, Result, Session, DEVICE_INTERFACE, FILE_FORMAT_VERSION, TUHI_SERVICE,
};

const EACCES: i32 = 13;

/// Where a [`Device`] is in the registration handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Unregistered,
    /// `Register` was sent; waiting for the device to show up in the manager's device list.
    Registering,
    Registered,
}

/// Charging state reported by the daemon's `BatteryState` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryState {
    Unknown,
    Charging,
    Discharging,
}

impl BatteryState {
    fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Charging,
            2 => Self::Discharging,
            _ => Self::Unknown,
        }
    }

    /// Returns the value used on the bus.
    pub fn as_raw(self) -> u32 {
        match self {
            Self::Unknown => 0,
            Self::Charging => 1,
            Self::Discharging => 2,
        }
    }
}

impl Serialize for BatteryState {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.as_raw())
    }
}

/// Changes republished by a [`Device`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum DeviceChange {
    /// [`Device::is_connected`].
    Connected,
    /// [`Device::drawings_available`].
    DrawingsAvailable,
    /// [`Device::is_listening`]. Also emitted when the daemon reports that listening stopped.
    Listening,
    /// [`Device::battery_percent`].
    BatteryPercent,
    /// [`Device::battery_state`].
    BatteryState,
}

/// Property changes that are republished, in priority order. Only the first one present in a
/// `PropertiesChanged` batch is republished.
const REPUBLISHED: [(&str, DeviceChange); 4] = [
    ("DrawingsAvailable", DeviceChange::DrawingsAvailable),
    ("Listening", DeviceChange::Listening),
    ("BatteryPercent", DeviceChange::BatteryPercent),
    ("BatteryState", DeviceChange::BatteryState),
];

/// A tablet exposed by the daemon.
///
/// Two [`Device`]s are equal if they have the same hardware [`Address`], even if they were created
/// for different object paths.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

struct DeviceInner {
    object: RemoteObject,
    bluez: BluezDevice,
    address: Address,
    manager: WeakManager,
    state: Mutex<DeviceState>,
    changes: Observers<DeviceChange>,
}

struct DeviceState {
    registration: Registration,
    live: bool,
    manager_subscription: Option<SubscriptionId>,
}

impl Device {
    pub(crate) async fn new(
        session: &Session,
        manager: WeakManager,
        path: OwnedObjectPath,
        registration: Registration,
    ) -> Result<Self> {
        let target = Target::new(session.daemon_bus(), TUHI_SERVICE, DEVICE_INTERFACE, path);
        let object = RemoteObject::bind(session, target).await?;
        let bluez_path = object
            .property::<ObjectPath<'static>>("BlueZDevice")
            .map(OwnedObjectPath::from)
            .ok_or_else(|| {
                Error::from(format!("{} has no BlueZ device", object.path().as_str()))
            })?;
        let bluez = BluezDevice::bind(session, bluez_path).await?;
        let address = bluez.address()?;

        let inner = Arc::new_cyclic(|weak: &Weak<DeviceInner>| {
            let weak = weak.clone();
            bluez.changes().subscribe(move |change| {
                if let Some(inner) = weak.upgrade() {
                    match change {
                        BluezChange::Connected => inner.changes.notify(&DeviceChange::Connected),
                    }
                }
            });

            DeviceInner {
                object,
                bluez,
                address,
                manager,
                state: Mutex::new(DeviceState {
                    registration,
                    live: false,
                    manager_subscription: None,
                }),
                changes: Observers::new(),
            }
        });

        Ok(Self { inner })
    }

    /// Returns the daemon's object path for this device.
    pub fn path(&self) -> &OwnedObjectPath {
        self.inner.object.path()
    }

    pub(crate) fn bluez(&self) -> &BluezDevice {
        &self.inner.bluez
    }

    /// Returns the hardware [`Address`] of the device.
    pub fn address(&self) -> Address {
        self.inner.address
    }

    pub fn name(&self) -> Option<String> {
        self.inner.bluez.name()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.bluez.is_connected()
    }

    pub fn is_listening(&self) -> bool {
        self.inner.object.property("Listening").unwrap_or(false)
    }

    /// Returns the timestamps of the drawings stored on the device.
    pub fn drawings_available(&self) -> Vec<u64> {
        self.inner
            .object
            .property("DrawingsAvailable")
            .unwrap_or_default()
    }

    pub fn battery_percent(&self) -> Option<u32> {
        self.inner.object.property("BatteryPercent")
    }

    pub fn battery_state(&self) -> BatteryState {
        self.inner
            .object
            .property("BatteryState")
            .map(BatteryState::from_raw)
            .unwrap_or(BatteryState::Unknown)
    }

    /// Returns the drawing area as `(width, height)`, if the daemon knows it.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.inner.object.property("Dimensions")
    }

    /// Returns whether a live session started by [`Device::start_live`] is running.
    pub fn is_live(&self) -> bool {
        lock(&self.inner.state).live
    }

    pub fn registration(&self) -> Registration {
        lock(&self.inner.state).registration
    }

    pub fn changes(&self) -> &Observers<DeviceChange> {
        &self.inner.changes
    }

    pub fn downgrade(&self) -> WeakDevice {
        WeakDevice(Arc::downgrade(&self.inner))
    }

    /// Asks the daemon to register the device.
    ///
    /// The daemon doesn't answer `Register`, so the device stays [`Registration::Registering`]
    /// until the manager lists it among its devices. There is no timeout; if the user never
    /// presses the button, the device stays in that state.
    pub async fn register(&self) -> Result<()> {
        log::debug!("{}: Register", self);
        let manager = self
            .inner
            .manager
            .upgrade()
            .ok_or_else(|| Error::from("the device manager is gone"))?;

        {
            let mut state = lock(&self.inner.state);
            if state.manager_subscription.is_none() {
                let weak = self.downgrade();
                let id = manager.changes().subscribe(move |event| {
                    if let ManagerEvent::DevicesChanged = event {
                        if let Some(device) = weak.upgrade() {
                            device.on_manager_devices_changed();
                        }
                    }
                });
                state.manager_subscription = Some(id);
            }
            state.registration = Registration::Registering;
        }

        if let Err(e) = self.inner.object.call_noreply(Method::Register).await {
            let subscription = {
                let mut state = lock(&self.inner.state);
                state.registration = Registration::Unregistered;
                state.manager_subscription.take()
            };
            if let Some(id) = subscription {
                manager.changes().unsubscribe(id);
            }
            return Err(e);
        }

        Ok(())
    }

    fn on_manager_devices_changed(&self) {
        let Some(manager) = self.inner.manager.upgrade() else {
            return;
        };
        if !manager.devices().iter().any(|d| d == self) {
            return;
        }

        let subscription = {
            let mut state = lock(&self.inner.state);
            if state.registration != Registration::Registering {
                return;
            }
            state.registration = Registration::Registered;
            state.manager_subscription.take()
        };
        if let Some(id) = subscription {
            manager.changes().unsubscribe(id);
        }
        log::info!("{}: Registration successful", self);
    }

    pub async fn start_listening(&self) -> Result<()> {
        self.inner.object.call(Method::StartListening).await?;
        Ok(())
    }

    /// Stops listening. Succeeds if the daemon has already gone away.
    pub async fn stop_listening(&self) -> Result<()> {
        match self.inner.object.call(Method::StopListening).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_service_unknown() => {
                log::debug!("{}: daemon gone, listening already stopped", self);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Starts a live session, handing `channel` to the daemon to stream pen data into.
    ///
    /// Returns whether the daemon accepted the session.
    pub async fn start_live(&self, channel: BorrowedFd<'_>) -> Result<bool> {
        let status = self
            .inner
            .object
            .call(Method::StartLive(channel.as_raw_fd()))
            .await?
            .into_status()?;
        if status != 0 {
            log::warn!("{}: daemon refused live mode (status {})", self, status);
            return Ok(false);
        }

        lock(&self.inner.state).live = true;
        Ok(true)
    }

    pub async fn stop_live(&self) -> Result<()> {
        let result = self.inner.object.call(Method::StopLive).await;
        lock(&self.inner.state).live = false;
        result.map(drop)
    }

    /// Fetches one drawing as the daemon's JSON document.
    pub async fn fetch_drawing(&self, timestamp: u64) -> Result<String> {
        self.inner
            .object
            .call(Method::GetJsonData {
                format: FILE_FORMAT_VERSION,
                timestamp,
            })
            .await?
            .into_json()
    }

    pub(crate) fn handle(&self, event: &Event) {
        match event {
            Event::Signal { name, args } => match name.as_str() {
                "ButtonPressRequired" => log::info!("{}: Press button on device now", self),
                "ListeningStopped" => {
                    let err = args.first().and_then(decode::<i32>).unwrap_or(0);
                    if err == -EACCES {
                        log::error!("{}: wrong device, please re-register.", self);
                    } else if err < 0 {
                        log::error!(
                            "{}: an error occurred: {}",
                            self,
                            io::Error::from_raw_os_error(-err)
                        );
                    }
                    self.inner.changes.notify(&DeviceChange::Listening);
                }
                _ => {}
            },
            Event::PropertiesChanged { changed, .. } => {
                let change = REPUBLISHED
                    .iter()
                    .find(|(name, _)| changed.contains_key(*name))
                    .map(|(_, change)| *change);
                if let Some(change) = change {
                    self.inner.changes.notify(&change);
                }
            }
        }
    }

    /// Drops the registration watch, and releases the BlueZ object and the device object.
    pub fn terminate(&self) {
        let subscription = lock(&self.inner.state).manager_subscription.take();
        if let (Some(id), Some(manager)) = (subscription, self.inner.manager.upgrade()) {
            manager.changes().unsubscribe(id);
        }
        self.inner.bluez.terminate();
        self.inner.object.terminate();
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.inner.address == other.inner.address
    }
}

impl Eq for Device {}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - {}",
            self.inner.address,
            self.name().unwrap_or_default()
        )
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("address", &self.inner.address)
            .field("path", self.path())
            .finish()
    }
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let subscription = state.manager_subscription.take();
        if let (Some(id), Some(manager)) = (subscription, self.manager.upgrade()) {
            manager.changes().unsubscribe(id);
        }
    }
}

/// A [`Device`] reference that doesn't keep the device alive.
#[derive(Clone)]
pub struct WeakDevice(Weak<DeviceInner>);

impl WeakDevice {
    pub fn upgrade(&self) -> Option<Device> {
        self.0.upgrade().map(|inner| Device { inner })
    }
}
