//! [`Transport`] implementation talking to real buses via zbus.

use std::{
    collections::HashMap,
    pin::pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use futures_util::{
    future::{abortable, AbortHandle, BoxFuture, FutureExt},
    stream::select,
    StreamExt,
};
use zbus::{
    fdo::{DBusProxy, PropertiesChanged, PropertiesChangedStream, PropertiesProxy},
    names::{BusName, InterfaceName},
    zvariant::{Fd, OwnedValue, Structure},
    CacheProperties, Connection, Message, Proxy, ProxyBuilder, SignalStream,
};

use super::{Binding, BusScope, Event, Method, Notification, Reply, Target, Transport};
use crate::{
    event_loop::LoopHandle, observer::lock, Error, Result, BLUEZ_DEVICE_INTERFACE,
    DEVICE_INTERFACE, MANAGER_INTERFACE,
};

mod private {
    use zbus::{dbus_proxy, zvariant::Fd};

    #[dbus_proxy(
        interface = "org.freedesktop.tuhi1.Manager",
        default_service = "org.freedesktop.tuhi1",
        assume_defaults = false
    )]
    trait Manager {
        async fn start_search(&self) -> zbus::Result<()>;
        async fn stop_search(&self) -> zbus::Result<()>;

        #[dbus_proxy(property)]
        fn searching(&self) -> zbus::Result<bool>;
    }

    #[dbus_proxy(
        interface = "org.freedesktop.tuhi1.Device",
        default_service = "org.freedesktop.tuhi1",
        assume_defaults = false
    )]
    trait Device {
        /// The daemon never answers this one.
        #[dbus_proxy(no_reply)]
        async fn register(&self) -> zbus::Result<()>;
        async fn start_listening(&self) -> zbus::Result<()>;
        async fn stop_listening(&self) -> zbus::Result<()>;
        async fn start_live(&self, fd: Fd) -> zbus::Result<i32>;
        async fn stop_live(&self) -> zbus::Result<()>;
        #[dbus_proxy(name = "GetJSONData")]
        async fn get_json_data(&self, file_version: u32, timestamp: u64) -> zbus::Result<String>;

        #[dbus_proxy(property)]
        fn listening(&self) -> zbus::Result<bool>;
    }

    #[dbus_proxy(
        interface = "org.bluez.Device1",
        default_service = "org.bluez",
        assume_defaults = false
    )]
    trait BluezDevice {
        #[dbus_proxy(property)]
        fn address(&self) -> zbus::Result<String>;

        #[dbus_proxy(property)]
        fn name(&self) -> zbus::Result<String>;

        #[dbus_proxy(property)]
        fn connected(&self) -> zbus::Result<bool>;
    }
}

use private::{BluezDeviceProxy, DeviceProxy, ManagerProxy};

/// Shares one connection per [`BusScope`] between every object bound on it.
///
/// Connections are established on first use and dropped once the last binding using them is
/// released.
#[derive(Default)]
struct ConnectionPool {
    slots: Mutex<HashMap<BusScope, Slot>>,
}

struct Slot {
    conn: Connection,
    users: usize,
}

impl ConnectionPool {
    async fn acquire(&self, scope: BusScope) -> Result<Connection> {
        let existing = {
            let mut slots = lock(&self.slots);
            slots.get_mut(&scope).map(|slot| {
                slot.users += 1;
                slot.conn.clone()
            })
        };
        if let Some(conn) = existing {
            return Ok(conn);
        }

        let conn = match scope {
            BusScope::Session => Connection::session().await,
            BusScope::System => Connection::system().await,
        }
        .map_err(Error::connection)?;

        // Another binding may have connected while we were waiting; keep the first connection.
        let mut slots = lock(&self.slots);
        let slot = slots.entry(scope).or_insert_with(|| {
            log::debug!("connected to {} bus as {:?}", scope, conn.unique_name());
            Slot { conn, users: 0 }
        });
        slot.users += 1;
        Ok(slot.conn.clone())
    }

    fn release(&self, scope: BusScope) {
        let mut slots = lock(&self.slots);
        if let Some(slot) = slots.get_mut(&scope) {
            slot.users = slot.users.saturating_sub(1);
            if slot.users == 0 {
                log::debug!("last user of the {} bus connection is gone", scope);
                slots.remove(&scope);
            }
        }
    }
}

/// Binds remote objects on the session and system buses.
pub struct DBusTransport {
    pool: Arc<ConnectionPool>,
    events: LoopHandle,
}

impl DBusTransport {
    /// Creates a transport delivering events to the loop behind `events`.
    ///
    /// No connection is made until the first object is bound.
    pub fn new(events: LoopHandle) -> Self {
        Self {
            pool: Arc::new(ConnectionPool::default()),
            events,
        }
    }

    async fn bind_impl(&self, target: &Target) -> Result<Box<dyn Binding>> {
        let conn = self.pool.acquire(target.scope).await?;
        match self.bind_on(&conn, target).await {
            Ok(binding) => Ok(Box::new(binding)),
            Err(e) => {
                self.pool.release(target.scope);
                Err(e)
            }
        }
    }

    async fn bind_on(&self, conn: &Connection, target: &Target) -> Result<DBusBinding> {
        let service = BusName::try_from(target.service).map_err(Error::from)?;
        let has_owner = DBusProxy::new(conn)
            .await
            .map_err(Error::from)?
            .name_has_owner(service)
            .await
            .map_err(Error::from)?;
        if !has_owner {
            return Err(Error::no_provider(target.service));
        }

        let proxy = TypedProxy::build(conn, target).await?;

        // Property changes are signaled via the `PropertiesChanged` signal on the
        // `org.freedesktop.DBus.Properties` interface. We keep our own cache so that it is
        // guaranteed to be updated before the change is delivered.
        let properties = PropertiesProxy::builder(conn)
            .destination(target.service)
            .map_err(Error::from)?
            .path(target.path.as_str().to_owned())
            .map_err(Error::from)?
            .build()
            .await
            .map_err(Error::from)?;
        let changes = properties
            .receive_properties_changed()
            .await
            .map_err(Error::from)?;
        let signals = proxy
            .inner()
            .receive_all_signals()
            .await
            .map_err(Error::from)?;

        let interface = InterfaceName::try_from(target.interface).map_err(Error::from)?;
        let cache = properties
            .get_all(interface)
            .await
            .map_err(Error::from)?;
        let cache = Arc::new(Mutex::new(cache));

        let (forward, abort) = abortable(forward(
            target.clone(),
            cache.clone(),
            changes,
            signals,
            self.events.clone(),
        ));
        conn.executor()
            .spawn(
                async move {
                    let _ = forward.await;
                },
                "tuhi-forward",
            )
            .detach();

        Ok(DBusBinding {
            scope: target.scope,
            pool: self.pool.clone(),
            proxy,
            cache,
            abort,
            released: AtomicBool::new(false),
        })
    }
}

impl Transport for DBusTransport {
    fn bind<'a>(&'a self, target: &'a Target) -> BoxFuture<'a, Result<Box<dyn Binding>>> {
        self.bind_impl(target).boxed()
    }
}

/// A generated proxy for one of the interfaces this crate binds.
enum TypedProxy {
    Manager(ManagerProxy<'static>),
    Device(DeviceProxy<'static>),
    Bluez(BluezDeviceProxy<'static>),
}

impl TypedProxy {
    async fn build(conn: &Connection, target: &Target) -> Result<Self> {
        let proxy = match target.interface {
            MANAGER_INTERFACE => Self::Manager(
                configure(ManagerProxy::builder(conn), target)?
                    .build()
                    .await
                    .map_err(Error::from)?,
            ),
            DEVICE_INTERFACE => Self::Device(
                configure(DeviceProxy::builder(conn), target)?
                    .build()
                    .await
                    .map_err(Error::from)?,
            ),
            BLUEZ_DEVICE_INTERFACE => Self::Bluez(
                configure(BluezDeviceProxy::builder(conn), target)?
                    .build()
                    .await
                    .map_err(Error::from)?,
            ),
            other => return Err(Error::from(format!("no proxy for interface {}", other))),
        };
        Ok(proxy)
    }

    fn inner(&self) -> &Proxy<'static> {
        match self {
            Self::Manager(proxy) => proxy.inner(),
            Self::Device(proxy) => proxy.inner(),
            Self::Bluez(proxy) => proxy.inner(),
        }
    }
}

fn configure<T>(
    builder: ProxyBuilder<'static, T>,
    target: &Target,
) -> Result<ProxyBuilder<'static, T>> {
    // Properties are cached by the binding itself, see `properties_event`.
    Ok(builder
        .destination(target.service)
        .map_err(Error::from)?
        .path(target.path.as_str().to_owned())
        .map_err(Error::from)?
        .cache_properties(CacheProperties::No))
}

struct DBusBinding {
    scope: BusScope,
    pool: Arc<ConnectionPool>,
    proxy: TypedProxy,
    cache: Arc<Mutex<HashMap<String, OwnedValue>>>,
    abort: AbortHandle,
    released: AtomicBool,
}

impl DBusBinding {
    async fn call_impl(&self, method: Method) -> Result<Reply> {
        let reply = match (&self.proxy, method) {
            (TypedProxy::Manager(proxy), Method::StartSearch) => {
                proxy.start_search().await.map(|()| Reply::Unit)
            }
            (TypedProxy::Manager(proxy), Method::StopSearch) => {
                proxy.stop_search().await.map(|()| Reply::Unit)
            }
            (TypedProxy::Device(proxy), Method::Register) => {
                proxy.register().await.map(|()| Reply::Unit)
            }
            (TypedProxy::Device(proxy), Method::StartListening) => {
                proxy.start_listening().await.map(|()| Reply::Unit)
            }
            (TypedProxy::Device(proxy), Method::StopListening) => {
                proxy.stop_listening().await.map(|()| Reply::Unit)
            }
            (TypedProxy::Device(proxy), Method::StartLive(fd)) => {
                proxy.start_live(Fd::from(fd)).await.map(Reply::Status)
            }
            (TypedProxy::Device(proxy), Method::StopLive) => {
                proxy.stop_live().await.map(|()| Reply::Unit)
            }
            (TypedProxy::Device(proxy), Method::GetJsonData { format, timestamp }) => {
                proxy.get_json_data(format, timestamp).await.map(Reply::Json)
            }
            (proxy, method) => {
                return Err(Error::from(format!(
                    "{} has no method {}",
                    proxy.inner().interface(),
                    method.name()
                )))
            }
        };
        reply.map_err(Error::from)
    }
}

impl Binding for DBusBinding {
    fn cached_property(&self, name: &str) -> Option<OwnedValue> {
        lock(&self.cache).get(name).cloned()
    }

    fn call(&self, method: Method) -> BoxFuture<'_, Result<Reply>> {
        self.call_impl(method).boxed()
    }

    fn call_noreply(&self, method: Method) -> BoxFuture<'_, Result<()>> {
        // Only `Register` is declared one-way; anything else still waits for its reply.
        self.call_impl(method).map(|reply| reply.map(drop)).boxed()
    }

    fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.abort.abort();
            self.pool.release(self.scope);
        }
    }
}

impl Drop for DBusBinding {
    fn drop(&mut self) {
        self.release();
    }
}

enum Incoming {
    Changed(PropertiesChanged),
    Signal(Arc<Message>),
}

/// Translates bus traffic of one object into [`Notification`]s until aborted.
async fn forward(
    target: Target,
    cache: Arc<Mutex<HashMap<String, OwnedValue>>>,
    changes: PropertiesChangedStream<'static>,
    signals: SignalStream<'static>,
    events: LoopHandle,
) {
    let mut stream = pin!(select(
        changes.map(Incoming::Changed),
        signals.map(Incoming::Signal)
    ));

    while let Some(incoming) = stream.next().await {
        let event = match incoming {
            Incoming::Changed(changed) => match properties_event(&target, &cache, &changed) {
                Some(event) => event,
                None => continue,
            },
            Incoming::Signal(message) => match signal_event(&message) {
                Some(event) => event,
                None => continue,
            },
        };

        if !events.post(Notification {
            target: target.clone(),
            event,
        }) {
            break;
        }
    }

    log::debug!("event stream of {} ended", target);
}

fn properties_event(
    target: &Target,
    cache: &Mutex<HashMap<String, OwnedValue>>,
    changed: &PropertiesChanged,
) -> Option<Event> {
    let args = match changed.args() {
        Ok(args) => args,
        Err(e) => {
            log::warn!("{}: malformed PropertiesChanged: {}", target, e);
            return None;
        }
    };
    if args.interface_name.as_str() != target.interface {
        return None;
    }

    log::trace!(
        "{}: changed {:?}, invalidated {:?}",
        target.path.as_str(),
        args.changed_properties.keys(),
        args.invalidated_properties,
    );

    let changed = args
        .changed_properties
        .iter()
        .map(|(name, value)| (name.to_string(), OwnedValue::from(value.clone())))
        .collect::<HashMap<_, _>>();
    let invalidated = args
        .invalidated_properties
        .iter()
        .map(|name| name.to_string())
        .collect::<Vec<_>>();

    let mut cache = lock(cache);
    for (name, value) in &changed {
        cache.insert(name.clone(), value.clone());
    }
    for name in &invalidated {
        cache.remove(name);
    }

    Some(Event::PropertiesChanged {
        changed,
        invalidated,
    })
}

fn signal_event(message: &Message) -> Option<Event> {
    let name = message.member()?.to_string();
    // Signals without arguments have an empty body, which doesn't decode as a structure.
    let args = message
        .body::<Structure<'_>>()
        .map(|body| {
            body.into_fields()
                .into_iter()
                .map(OwnedValue::from)
                .collect()
        })
        .unwrap_or_default();
    Some(Event::Signal { name, args })
}

#[cfg(test)]
mod tests {
    use zbus::zvariant::{ObjectPath, OwnedObjectPath, Value};

    use super::*;
    use crate::{transport::decode, TUHI_SERVICE};

    fn target() -> Target {
        Target::new(
            BusScope::Session,
            TUHI_SERVICE,
            DEVICE_INTERFACE,
            OwnedObjectPath::try_from("/d1").unwrap(),
        )
    }

    fn properties_changed(interface: &str, listening: bool) -> PropertiesChanged {
        let changed = HashMap::from([("Listening", Value::from(listening))]);
        let message = Message::signal(
            None::<&str>,
            None::<&str>,
            "/d1",
            "org.freedesktop.DBus.Properties",
            "PropertiesChanged",
            &(interface, changed, vec!["BatteryPercent"]),
        )
        .unwrap();
        PropertiesChanged::from_message(message).unwrap()
    }

    #[test]
    fn changes_update_the_cache_first() {
        let cache = Mutex::new(HashMap::from([(
            "BatteryPercent".to_string(),
            OwnedValue::from(40u32),
        )]));

        let changed = properties_changed(DEVICE_INTERFACE, true);
        match properties_event(&target(), &cache, &changed).unwrap() {
            Event::PropertiesChanged {
                changed,
                invalidated,
            } => {
                assert_eq!(changed.len(), 1);
                assert_eq!(decode::<bool>(&changed["Listening"]), Some(true));
                assert_eq!(invalidated, ["BatteryPercent"]);
            }
            other => panic!("unexpected {:?}", other),
        }

        let cache = lock(&cache);
        assert!(cache.contains_key("Listening"));
        assert!(!cache.contains_key("BatteryPercent"));
    }

    #[test]
    fn changes_of_other_interfaces_are_dropped() {
        let cache = Mutex::new(HashMap::new());
        let changed = properties_changed(MANAGER_INTERFACE, true);
        assert!(properties_event(&target(), &cache, &changed).is_none());
        assert!(lock(&cache).is_empty());
    }

    #[test]
    fn signal_arguments() {
        let message = Message::signal(
            None::<&str>,
            None::<&str>,
            "/org/freedesktop/tuhi1",
            MANAGER_INTERFACE,
            "UnregisteredDevice",
            &(ObjectPath::try_from("/d2").unwrap(),),
        )
        .unwrap();
        match signal_event(&message).unwrap() {
            Event::Signal { name, args } => {
                assert_eq!(name, "UnregisteredDevice");
                assert_eq!(args.len(), 1);
                let path = decode::<ObjectPath<'static>>(&args[0]).unwrap();
                assert_eq!(path.as_str(), "/d2");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn signal_without_arguments() {
        let message = Message::signal(
            None::<&str>,
            None::<&str>,
            "/d1",
            DEVICE_INTERFACE,
            "ButtonPressRequired",
            &(),
        )
        .unwrap();
        match signal_event(&message).unwrap() {
            Event::Signal { name, args } => {
                assert_eq!(name, "ButtonPressRequired");
                assert!(args.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
