//! The REST adapter.
//!
//! [`Tuhi`] owns the [`Manager`] and the event loop thread that keeps it current, and answers the
//! operations of the REST API with [`view`] types. The HTTP layer itself is not part of this crate;
//! [`controller`] maps the operations to status codes and JSON bodies for it.
//!
//! All operations block the calling thread until the daemon has answered.

pub mod controller;
pub mod view;

use std::sync::{Arc, Mutex};

use once_cell::sync::OnceCell;

use crate::{
    address::Address,
    config::Settings,
    device::DeviceChange,
    event_loop::{EventLoop, LoopHandle, TimerId},
    manager::ManagerEvent,
    observer::lock,
    Device, Error, Manager, Result, Session,
};

pub use view::{ApiResponse, DeviceView};

static INSTANCE: OnceCell<Tuhi> = OnceCell::new();

pub struct Tuhi {
    events: LoopHandle,
    settings: Settings,
    manager: Option<Manager>,
    /// Devices reported by the daemon during the current discovery window. Only the event loop
    /// thread modifies this.
    discovered: Arc<Mutex<Vec<Device>>>,
    discovery_timeout: Mutex<Option<TimerId>>,
}

impl Tuhi {
    /// Returns the process-wide adapter, creating it on first use.
    ///
    /// The first call starts the event loop thread and connects to the daemon using
    /// [`Settings::from_env`]. If the daemon isn't running, the adapter is still created, but it
    /// knows no devices.
    pub fn instance() -> Result<&'static Tuhi> {
        INSTANCE.get_or_try_init(|| {
            let settings = Settings::from_env();
            let (events, _thread) = EventLoop::spawn().map_err(Error::from)?;
            let session = Session::dbus(events.clone())
                .with_daemon_bus(settings.daemon_bus);
            Tuhi::with_session(&session, events, settings)
        })
    }

    /// Creates an adapter on top of an existing session and event loop.
    pub fn with_session(session: &Session, events: LoopHandle, settings: Settings) -> Result<Self> {
        let manager = match pollster::block_on(Manager::new(session)) {
            Ok(manager) => Some(manager),
            Err(e) if e.is_no_provider() || e.is_connection() => {
                log::warn!("tuhi is not available: {}", e);
                None
            }
            Err(e) => return Err(e),
        };

        let discovered = Arc::new(Mutex::new(Vec::<Device>::new()));
        if let Some(manager) = &manager {
            for device in manager.devices() {
                let weak = device.downgrade();
                device.changes().subscribe(move |change| {
                    if let (DeviceChange::Listening, Some(device)) = (change, weak.upgrade()) {
                        log::info!("{}: listening: {}", device, device.is_listening());
                    }
                });
            }

            let list = discovered.clone();
            manager.changes().subscribe(move |event| {
                if let ManagerEvent::UnregisteredDevice(device) = event {
                    let mut list = lock(&list);
                    if !list.contains(device) {
                        log::debug!("discovered {}", device);
                        list.push(device.clone());
                    }
                }
            });

            events.attach(Arc::new(manager.clone()));
        }

        Ok(Self {
            events,
            settings,
            manager,
            discovered,
            discovery_timeout: Mutex::new(None),
        })
    }

    pub fn manager(&self) -> Option<&Manager> {
        self.manager.as_ref()
    }

    /// Returns every registered device, including the contents of its drawings.
    ///
    /// Every drawing is fetched from the device, so this takes one round trip per drawing.
    pub fn list_devices(&self) -> Result<Vec<DeviceView>> {
        let Some(manager) = &self.manager else {
            return Ok(Vec::new());
        };
        manager.devices().iter().map(full_view).collect()
    }

    /// Returns the registered device with address `id`.
    pub fn device(&self, id: &str) -> Result<Option<DeviceView>> {
        match self.registered(id) {
            Some(device) => full_view(&device).map(Some),
            None => Ok(None),
        }
    }

    /// Starts a search and returns the devices discovered so far.
    ///
    /// The search is stopped and the discovered devices are forgotten once the discovery timeout
    /// expires. Starting another search restarts the timeout.
    pub fn search_unregistered(&self) -> Result<Vec<DeviceView>> {
        let Some(manager) = &self.manager else {
            return Ok(Vec::new());
        };
        pollster::block_on(manager.start_search())?;
        let views = lock(&self.discovered)
            .iter()
            .map(DeviceView::brief)
            .collect();

        let timer = {
            let manager = manager.clone();
            let discovered = self.discovered.clone();
            self.events
                .schedule(self.settings.discovery_timeout, async move {
                    log::debug!("discovery window closed");
                    if let Err(e) = manager.stop_search().await {
                        log::warn!("failed to stop searching: {}", e);
                    }
                    lock(&discovered).clear();
                })
        };
        if let Some(previous) = lock(&self.discovery_timeout).replace(timer) {
            self.events.cancel(previous);
        }

        Ok(views)
    }

    /// Registers the discovered device with address `id`.
    ///
    /// Returns `false` if no such device was discovered in the current window. Registration
    /// completes asynchronously once the user confirms it on the device.
    pub fn register(&self, id: &str) -> Result<bool> {
        let Ok(address) = id.parse::<Address>() else {
            return Ok(false);
        };
        let device = lock(&self.discovered)
            .iter()
            .find(|d| d.address() == address)
            .cloned();
        match device {
            Some(device) => {
                pollster::block_on(device.register())?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Starts or stops listening on the registered device with address `id`.
    ///
    /// Returns the listening state reported afterwards, or `None` if there is no such device.
    pub fn toggle_listening(&self, id: &str, enable: bool) -> Result<Option<bool>> {
        let Some(device) = self.registered(id) else {
            return Ok(None);
        };
        if enable {
            pollster::block_on(device.start_listening())?;
        } else {
            pollster::block_on(device.stop_listening())?;
        }
        Ok(Some(device.is_listening()))
    }

    fn registered(&self, id: &str) -> Option<Device> {
        let address = id.parse::<Address>().ok()?;
        self.manager.as_ref()?.device(&address)
    }
}

fn full_view(device: &Device) -> Result<DeviceView> {
    let drawings = device
        .drawings_available()
        .into_iter()
        .map(|timestamp| {
            let json = pollster::block_on(device.fetch_drawing(timestamp))?;
            serde_json::from_str(&json).map_err(Error::from)
        })
        .collect::<Result<Vec<serde_json::Value>>>()?;
    Ok(DeviceView::full(device, drawings))
}
