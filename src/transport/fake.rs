//! An in-memory stand-in for the tuhi daemon and BlueZ, used by the unit tests.
//!
//! Objects exist as soon as a property is set on them. Method calls are recorded and answered the
//! way the daemon would, updating properties and posting the matching notifications to the event
//! loop.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use futures_util::future::{BoxFuture, FutureExt};
use zbus::zvariant::{ObjectPath, OwnedObjectPath, OwnedValue, Value};

use super::{Binding, BusScope, Event, Method, Notification, Reply, Target, Transport};
use crate::{
    error::SERVICE_UNKNOWN, event_loop::LoopHandle, observer::lock, Error, Result, Session,
    BLUEZ_DEVICE_INTERFACE, BLUEZ_SERVICE, DEVICE_INTERFACE, MANAGER_INTERFACE, ROOT_PATH,
    TUHI_SERVICE,
};

pub(crate) fn path(s: &str) -> OwnedObjectPath {
    OwnedObjectPath::try_from(s).unwrap()
}

pub(crate) fn value(v: impl Into<Value<'static>>) -> OwnedValue {
    OwnedValue::from(v.into())
}

pub(crate) fn paths(list: &[&str]) -> Value<'static> {
    Value::from(
        list.iter()
            .map(|p| ObjectPath::try_from(p.to_string()).unwrap())
            .collect::<Vec<_>>(),
    )
}

struct State {
    events: LoopHandle,
    providers: Mutex<HashSet<&'static str>>,
    objects: Mutex<HashMap<String, HashMap<String, OwnedValue>>>,
    calls: Mutex<Vec<(String, Method)>>,
    failures: Mutex<HashMap<&'static str, String>>,
    drawings: Mutex<HashMap<u64, String>>,
    live_status: Mutex<i32>,
    bound: AtomicUsize,
    released: AtomicUsize,
}

#[derive(Clone)]
pub(crate) struct FakeDaemon {
    state: Arc<State>,
}

impl FakeDaemon {
    /// Creates a daemon with an empty manager object, BlueZ running and no devices.
    pub fn new(events: LoopHandle) -> Self {
        let daemon = Self {
            state: Arc::new(State {
                events,
                providers: Mutex::new([TUHI_SERVICE, BLUEZ_SERVICE].into_iter().collect()),
                objects: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
                failures: Mutex::new(HashMap::new()),
                drawings: Mutex::new(HashMap::new()),
                live_status: Mutex::new(0),
                bound: AtomicUsize::new(0),
                released: AtomicUsize::new(0),
            }),
        };
        daemon.set_property(ROOT_PATH, "Devices", paths(&[]));
        daemon.set_property(ROOT_PATH, "Searching", false);
        daemon
    }

    pub fn session(&self) -> Session {
        Session::new(self.clone())
    }

    /// Makes binds to `service` fail as if nobody owned the name.
    pub fn remove_provider(&self, service: &'static str) {
        lock(&self.state.providers).remove(service);
    }

    pub fn set_property(&self, path: &str, name: &str, v: impl Into<Value<'static>>) {
        lock(&self.state.objects)
            .entry(path.to_string())
            .or_default()
            .insert(name.to_string(), value(v));
    }

    /// Sets properties and posts one `PropertiesChanged` for them, like the daemon batches them.
    pub fn change_properties(
        &self,
        path: &str,
        interface: &'static str,
        props: Vec<(&str, Value<'static>)>,
    ) {
        let mut changed = HashMap::new();
        for (name, v) in props {
            self.set_property(path, name, v.clone());
            changed.insert(name.to_string(), value(v));
        }
        self.post(
            path,
            interface,
            Event::PropertiesChanged {
                changed,
                invalidated: Vec::new(),
            },
        );
    }

    pub fn emit_signal(
        &self,
        path: &str,
        interface: &'static str,
        name: &str,
        args: Vec<OwnedValue>,
    ) {
        self.post(
            path,
            interface,
            Event::Signal {
                name: name.to_string(),
                args,
            },
        );
    }

    fn post(&self, path: &str, interface: &'static str, event: Event) {
        self.state.events.post(Notification {
            target: target_for(interface, path),
            event,
        });
    }

    pub fn add_bluez_device(
        &self,
        bluez_path: &str,
        address: &str,
        name: &str,
    ) -> OwnedObjectPath {
        self.set_property(bluez_path, "Address", address.to_uppercase());
        self.set_property(bluez_path, "Name", name.to_string());
        self.set_property(bluez_path, "Connected", false);
        path(bluez_path)
    }

    /// Creates a daemon device object at `device_path` backed by a BlueZ device.
    ///
    /// The device is not added to the manager's `Devices`.
    pub fn add_device(&self, device_path: &str, address: &str, name: &str) {
        let bluez_path = format!("/org/bluez/hci0/dev_{}", address.replace(':', "_"));
        self.add_bluez_device(&bluez_path, address, name);
        let bluez_path = ObjectPath::try_from(bluez_path).unwrap();
        self.set_property(device_path, "BlueZDevice", bluez_path);
        self.set_property(device_path, "Listening", false);
        self.set_property(device_path, "DrawingsAvailable", Vec::<u64>::new());
        self.set_property(device_path, "BatteryPercent", 0u32);
        self.set_property(device_path, "BatteryState", 0u32);
        self.set_property(device_path, "Dimensions", (0u32, 0u32));
    }

    /// Adds a device and lists it in the manager's `Devices` without notifying anyone.
    pub fn add_registered_device(&self, device_path: &str, address: &str, name: &str) {
        self.add_device(device_path, address, name);
        let mut registered = self.registered_paths();
        registered.push(device_path.to_string());
        let list = registered.iter().map(String::as_str).collect::<Vec<_>>();
        self.set_property(ROOT_PATH, "Devices", paths(&list));
    }

    pub fn registered_paths(&self) -> Vec<String> {
        lock(&self.state.objects)
            .get(ROOT_PATH)
            .and_then(|props| props.get("Devices"))
            .and_then(super::decode::<Vec<ObjectPath<'static>>>)
            .map(|list| list.into_iter().map(|p| p.to_string()).collect())
            .unwrap_or_default()
    }

    pub fn add_drawing(&self, device_path: &str, timestamp: u64, json: &str) {
        lock(&self.state.drawings).insert(timestamp, json.to_string());
        let mut available = lock(&self.state.objects)
            .get(device_path)
            .and_then(|props| props.get("DrawingsAvailable"))
            .and_then(super::decode::<Vec<u64>>)
            .unwrap_or_default();
        available.push(timestamp);
        self.set_property(device_path, "DrawingsAvailable", available);
    }

    /// Makes every call of `method` fail with the remote error `error_name`.
    pub fn fail(&self, method: &'static str, error_name: &str) {
        lock(&self.state.failures).insert(method, error_name.to_string());
    }

    pub fn set_live_status(&self, status: i32) {
        *lock(&self.state.live_status) = status;
    }

    pub fn calls(&self) -> Vec<(String, Method)> {
        lock(&self.state.calls).clone()
    }

    pub fn method_calls(&self, name: &str) -> usize {
        lock(&self.state.calls)
            .iter()
            .filter(|(_, method)| method.name() == name)
            .count()
    }

    pub fn bound(&self) -> usize {
        self.state.bound.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.state.released.load(Ordering::SeqCst)
    }

    fn answer(&self, path: &str, method: Method) -> Result<Reply> {
        lock(&self.state.calls).push((path.to_string(), method.clone()));
        if let Some(error_name) = lock(&self.state.failures).get(method.name()) {
            return Err(Error::remote(error_name, "injected failure"));
        }

        let reply = match method {
            Method::StartSearch => {
                self.change_properties(path, MANAGER_INTERFACE, vec![("Searching", true.into())]);
                Reply::Unit
            }
            Method::StopSearch => {
                self.change_properties(path, MANAGER_INTERFACE, vec![("Searching", false.into())]);
                Reply::Unit
            }
            Method::StartListening => {
                self.change_properties(path, DEVICE_INTERFACE, vec![("Listening", true.into())]);
                Reply::Unit
            }
            Method::StopListening => {
                self.change_properties(path, DEVICE_INTERFACE, vec![("Listening", false.into())]);
                Reply::Unit
            }
            Method::StartLive(_) => Reply::Status(*lock(&self.state.live_status)),
            Method::GetJsonData { timestamp, .. } => Reply::Json(
                lock(&self.state.drawings)
                    .get(&timestamp)
                    .cloned()
                    .unwrap_or_else(|| "{}".to_string()),
            ),
            Method::Register | Method::StopLive => Reply::Unit,
        };
        Ok(reply)
    }
}

fn target_for(interface: &'static str, path: &str) -> Target {
    let (scope, service) = if interface == BLUEZ_DEVICE_INTERFACE {
        (BusScope::System, BLUEZ_SERVICE)
    } else {
        (BusScope::Session, TUHI_SERVICE)
    };
    Target::new(scope, service, interface, self::path(path))
}

impl Transport for FakeDaemon {
    fn bind<'a>(&'a self, target: &'a Target) -> BoxFuture<'a, Result<Box<dyn Binding>>> {
        async move {
            if !lock(&self.state.providers).contains(target.service) {
                return Err(Error::no_provider(target.service));
            }
            self.state.bound.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeBinding {
                daemon: self.clone(),
                path: target.path.as_str().to_string(),
                released: AtomicBool::new(false),
            }) as Box<dyn Binding>)
        }
        .boxed()
    }
}

struct FakeBinding {
    daemon: FakeDaemon,
    path: String,
    released: AtomicBool,
}

impl Binding for FakeBinding {
    fn cached_property(&self, name: &str) -> Option<OwnedValue> {
        lock(&self.daemon.state.objects)
            .get(&self.path)
            .and_then(|props| props.get(name))
            .cloned()
    }

    fn call(&self, method: Method) -> BoxFuture<'_, Result<Reply>> {
        let reply = self.daemon.answer(&self.path, method);
        async move { reply }.boxed()
    }

    fn call_noreply(&self, method: Method) -> BoxFuture<'_, Result<()>> {
        let reply = self.daemon.answer(&self.path, method).map(drop);
        async move { reply }.boxed()
    }

    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.daemon.state.released.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// The remote error name for a callee that went away.
pub(crate) const GONE: &str = SERVICE_UNKNOWN;
