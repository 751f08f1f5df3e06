//! The daemon's singleton manager object.

use core::fmt;
use std::{
    collections::{BTreeMap, HashMap},
    mem,
    sync::{Arc, Mutex, Weak},
};

use futures_util::future::{BoxFuture, FutureExt};
use zbus::zvariant::{ObjectPath, OwnedObjectPath};

use crate::{
    address::Address,
    device::{Device, Registration},
    event_loop::Dispatch,
    observer::{lock, Observers},
    transport::{decode, Event, Method, Notification, RemoteObject, Target},
    Error, Result, Session, BLUEZ_DEVICE_INTERFACE, DEVICE_INTERFACE, MANAGER_INTERFACE,
    ROOT_PATH, TUHI_SERVICE,
};

/// Notifications published by a [`Manager`].
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    /// The daemon's list of registered devices changed. Sent once per change, after the
    /// registered collection has been updated.
    DevicesChanged,
    /// The search state may have changed, see [`Manager::is_searching`].
    Searching,
    /// The daemon found a device in pairing mode.
    ///
    /// If the device is already registered this is the registered [`Device`] (the user wants to
    /// register it again), otherwise it is a new unregistered one.
    UnregisteredDevice(Device),
}

/// Mirror of the daemon's manager and the devices it knows about.
///
/// [`Manager`] is a cheap, cloneable handle; clones share the same state. It must be attached to
/// the event loop (see [`LoopHandle::attach`](crate::event_loop::LoopHandle::attach)) to follow
/// the daemon.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    session: Session,
    object: RemoteObject,
    state: Mutex<ManagerState>,
    changes: Observers<ManagerEvent>,
}

#[derive(Default)]
struct ManagerState {
    devices: BTreeMap<Address, Device>,
    unregistered: HashMap<OwnedObjectPath, Device>,
}

impl Manager {
    /// Binds the daemon's manager and every device it has registered.
    ///
    /// Registered devices that can't be bound are skipped.
    ///
    /// # Errors
    ///
    /// Fails with a "no provider" error (see [`Error::is_no_provider`]) if the daemon isn't
    /// running.
    pub async fn new(session: &Session) -> Result<Self> {
        let path = OwnedObjectPath::try_from(ROOT_PATH).map_err(Error::from)?;
        let target = Target::new(session.daemon_bus(), TUHI_SERVICE, MANAGER_INTERFACE, path);
        let manager = Self {
            inner: Arc::new(ManagerInner {
                session: session.clone(),
                object: RemoteObject::bind(session, target).await?,
                state: Mutex::new(ManagerState::default()),
                changes: Observers::new(),
            }),
        };

        for path in manager.registered_paths() {
            let res = Device::new(
                session,
                manager.downgrade(),
                path.clone(),
                Registration::Registered,
            )
            .await;
            match res {
                Ok(device) => {
                    log::debug!("found registered device {}", device);
                    lock(&manager.inner.state)
                        .devices
                        .insert(device.address(), device);
                }
                Err(e) => log::warn!("skipping device at {}: {}", path.as_str(), e),
            }
        }

        Ok(manager)
    }

    fn registered_paths(&self) -> Vec<OwnedObjectPath> {
        self.inner
            .object
            .property::<Vec<ObjectPath<'static>>>("Devices")
            .unwrap_or_default()
            .into_iter()
            .map(OwnedObjectPath::from)
            .collect()
    }

    pub(crate) fn downgrade(&self) -> WeakManager {
        WeakManager(Arc::downgrade(&self.inner))
    }

    /// Returns the registered devices, ordered by address.
    pub fn devices(&self) -> Vec<Device> {
        lock(&self.inner.state).devices.values().cloned().collect()
    }

    /// Returns the registered device with the given address.
    pub fn device(&self, address: &Address) -> Option<Device> {
        lock(&self.inner.state).devices.get(address).cloned()
    }

    /// Returns the devices discovered by the current search that aren't registered yet.
    pub fn unregistered_devices(&self) -> Vec<Device> {
        lock(&self.inner.state)
            .unregistered
            .values()
            .cloned()
            .collect()
    }

    pub fn is_searching(&self) -> bool {
        self.inner.object.property("Searching").unwrap_or(false)
    }

    pub fn changes(&self) -> &Observers<ManagerEvent> {
        &self.inner.changes
    }

    /// Starts searching for devices in pairing mode.
    ///
    /// Devices found by earlier searches are forgotten.
    pub async fn start_search(&self) -> Result<()> {
        self.clear_unregistered();
        self.inner.object.call(Method::StartSearch).await?;
        Ok(())
    }

    /// Stops the search. Succeeds if the daemon has already gone away.
    ///
    /// The unregistered devices are forgotten even if the call fails.
    pub async fn stop_search(&self) -> Result<()> {
        let res = match self.inner.object.call(Method::StopSearch).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_service_unknown() => {
                log::debug!("daemon gone, search already stopped");
                Ok(())
            }
            Err(e) => Err(e),
        };
        self.clear_unregistered();
        res
    }

    fn clear_unregistered(&self) {
        let forgotten = mem::take(&mut lock(&self.inner.state).unregistered);
        drop(forgotten);
    }

    fn find_by_path(&self, path: &OwnedObjectPath) -> Option<Device> {
        let state = lock(&self.inner.state);
        state
            .devices
            .values()
            .find(|d| d.path() == path)
            .or_else(|| state.unregistered.get(path))
            .cloned()
    }

    fn find_by_bluez_path(&self, path: &OwnedObjectPath) -> Vec<Device> {
        let state = lock(&self.inner.state);
        state
            .devices
            .values()
            .chain(state.unregistered.values())
            .filter(|d| d.bluez().path() == path)
            .cloned()
            .collect()
    }

    async fn route(&self, notification: Notification) {
        let Notification { target, event } = notification;
        match target.interface {
            MANAGER_INTERFACE if &target.path == self.inner.object.path() => {
                self.handle(&event).await
            }
            DEVICE_INTERFACE => match self.find_by_path(&target.path) {
                Some(device) => device.handle(&event),
                None => log::trace!("ignoring event for untracked {}", target),
            },
            BLUEZ_DEVICE_INTERFACE => {
                for device in self.find_by_bluez_path(&target.path) {
                    device.bluez().handle(&event);
                }
            }
            _ => log::trace!("ignoring event for {}", target),
        }
    }

    async fn handle(&self, event: &Event) {
        match event {
            Event::PropertiesChanged { changed, .. } => {
                if let Some(value) = changed.get("Devices") {
                    match decode::<Vec<ObjectPath<'static>>>(value) {
                        Some(paths) => self.on_devices_changed(paths),
                        None => log::warn!("ignoring malformed Devices property: {:?}", value),
                    }
                }
                if event.touches("Searching") {
                    self.inner.changes.notify(&ManagerEvent::Searching);
                }
            }
            Event::Signal { name, args } => match name.as_str() {
                "SearchStopped" => self.inner.changes.notify(&ManagerEvent::Searching),
                "UnregisteredDevice" => {
                    match args.first().and_then(decode::<ObjectPath<'static>>) {
                        Some(path) => self.on_unregistered_device(path.into()).await,
                        None => log::warn!("UnregisteredDevice without a device path"),
                    }
                }
                _ => {}
            },
        }
    }

    fn on_devices_changed(&self, paths: Vec<ObjectPath<'static>>) {
        let migrated = {
            let mut state = lock(&self.inner.state);
            let mut migrated = Vec::new();
            for path in paths {
                // Devices we called Register() on while they were already registered aren't
                // tracked as unregistered, so there is nothing to move.
                if let Some(device) = state.unregistered.remove(&OwnedObjectPath::from(path)) {
                    migrated.push(device.clone());
                    state.devices.insert(device.address(), device);
                }
            }
            migrated
        };

        for device in &migrated {
            log::debug!("{} is now registered", device);
        }
        self.inner.changes.notify(&ManagerEvent::DevicesChanged);
    }

    async fn on_unregistered_device(&self, path: OwnedObjectPath) {
        let known = self.find_by_path(&path);
        let device = match known {
            Some(device) => {
                log::debug!("{} is back in pairing mode", device);
                device
            }
            None => {
                let res = Device::new(
                    &self.inner.session,
                    self.downgrade(),
                    path.clone(),
                    Registration::Unregistered,
                )
                .await;
                match res {
                    Ok(device) => {
                        log::debug!("New unregistered device: {}", device);
                        lock(&self.inner.state)
                            .unregistered
                            .insert(path, device.clone());
                        device
                    }
                    Err(e) => {
                        log::warn!("skipping unregistered device at {}: {}", path.as_str(), e);
                        return;
                    }
                }
            }
        };

        self.inner
            .changes
            .notify(&ManagerEvent::UnregisteredDevice(device));
    }

    /// Terminates every tracked device and releases the manager object.
    pub fn terminate(&self) {
        let (devices, unregistered) = {
            let mut state = lock(&self.inner.state);
            (
                mem::take(&mut state.devices),
                mem::take(&mut state.unregistered),
            )
        };
        for device in devices.values().chain(unregistered.values()) {
            device.terminate();
        }
        self.inner.object.terminate();
    }
}

impl Dispatch for Manager {
    fn dispatch(&self, notification: Notification) -> BoxFuture<'_, ()> {
        self.route(notification).boxed()
    }
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("Manager")
            .field("devices", &state.devices.keys().collect::<Vec<_>>())
            .field("unregistered", &state.unregistered.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A [`Manager`] reference held by its devices.
#[derive(Clone)]
pub(crate) struct WeakManager(Weak<ManagerInner>);

impl WeakManager {
    pub(crate) fn upgrade(&self) -> Option<Manager> {
        self.0.upgrade().map(|inner| Manager { inner })
    }
}
