//! Remote object bindings.
//!
//! A [`RemoteObject`] is bound to one object on one of the two buses. It exposes the object's
//! cached properties and forwards its property changes and signals to the event loop as
//! [`Notification`]s. The bus itself is reached through the [`Transport`] capability carried by
//! the [`Session`].

use std::{
    collections::HashMap,
    fmt,
    os::fd::RawFd,
    sync::atomic::{AtomicBool, Ordering},
};

use futures_util::future::BoxFuture;
use zbus::zvariant::{OwnedObjectPath, OwnedValue, Value};

use crate::{Error, Result, Session};

pub mod dbus;
#[cfg(test)]
pub(crate) mod fake;

/// Selects one of the two isolated buses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusScope {
    /// The per-user session bus. The tuhi daemon lives here.
    Session,
    /// The privileged system bus. BlueZ lives here.
    System,
}

impl fmt::Display for BusScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BusScope::Session => "session",
            BusScope::System => "system",
        })
    }
}

/// Identifies one interface of one remote object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub scope: BusScope,
    pub service: &'static str,
    pub interface: &'static str,
    pub path: OwnedObjectPath,
}

impl Target {
    pub fn new(
        scope: BusScope,
        service: &'static str,
        interface: &'static str,
        path: OwnedObjectPath,
    ) -> Self {
        Self {
            scope,
            service,
            interface,
            path,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}{} ({})",
            self.scope,
            self.service,
            self.path.as_str(),
            self.interface
        )
    }
}

/// Something a remote object pushed to us.
#[derive(Debug, Clone)]
pub enum Event {
    /// `org.freedesktop.DBus.Properties.PropertiesChanged` for the bound interface.
    ///
    /// The binding's property cache already reflects the change when this is delivered.
    PropertiesChanged {
        changed: HashMap<String, OwnedValue>,
        invalidated: Vec<String>,
    },
    /// Any signal emitted on the bound interface.
    Signal { name: String, args: Vec<OwnedValue> },
}

impl Event {
    /// Returns whether the property `name` was changed or invalidated by this event.
    pub fn touches(&self, name: &str) -> bool {
        match self {
            Event::PropertiesChanged {
                changed,
                invalidated,
            } => changed.contains_key(name) || invalidated.iter().any(|n| n == name),
            Event::Signal { .. } => false,
        }
    }
}

/// An [`Event`] together with the object that produced it.
#[derive(Debug, Clone)]
pub struct Notification {
    pub target: Target,
    pub event: Event,
}

/// The daemon methods this crate invokes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    StartSearch,
    StopSearch,
    Register,
    StartListening,
    StopListening,
    /// Hands the descriptor to the daemon out-of-band, as a unix fd.
    StartLive(RawFd),
    StopLive,
    GetJsonData { format: u32, timestamp: u64 },
}

impl Method {
    pub fn name(&self) -> &'static str {
        match self {
            Method::StartSearch => "StartSearch",
            Method::StopSearch => "StopSearch",
            Method::Register => "Register",
            Method::StartListening => "StartListening",
            Method::StopListening => "StopListening",
            Method::StartLive(_) => "StartLive",
            Method::StopLive => "StopLive",
            Method::GetJsonData { .. } => "GetJSONData",
        }
    }
}

/// The decoded reply of a [`Method`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Unit,
    Status(i32),
    Json(String),
}

impl Reply {
    pub fn into_status(self) -> Result<i32> {
        match self {
            Reply::Status(status) => Ok(status),
            other => Err(Error::from(format!("expected a status reply, got {:?}", other))),
        }
    }

    pub fn into_json(self) -> Result<String> {
        match self {
            Reply::Json(json) => Ok(json),
            other => Err(Error::from(format!("expected a JSON reply, got {:?}", other))),
        }
    }
}

/// The bus capability: binds remote objects.
///
/// Implementations deliver every [`Event`] of a bound object to the event loop, in the order the
/// object emitted them.
pub trait Transport: Send + Sync + 'static {
    fn bind<'a>(&'a self, target: &'a Target) -> BoxFuture<'a, Result<Box<dyn Binding>>>;
}

/// A live binding to one remote object, produced by [`Transport::bind`].
pub trait Binding: Send + Sync {
    fn cached_property(&self, name: &str) -> Option<OwnedValue>;

    /// Calls `method` and waits for the reply.
    fn call(&self, method: Method) -> BoxFuture<'_, Result<Reply>>;

    /// Calls `method`, not waiting for a reply if the interface declares it one-way.
    fn call_noreply(&self, method: Method) -> BoxFuture<'_, Result<()>>;

    /// Stops event delivery and gives up this binding's share of the connection.
    fn release(&self);
}

/// A bound remote object.
///
/// Dropping a [`RemoteObject`] terminates it.
pub struct RemoteObject {
    target: Target,
    binding: Box<dyn Binding>,
    terminated: AtomicBool,
}

impl RemoteObject {
    /// Binds to `target` through the session's transport.
    ///
    /// # Errors
    ///
    /// Fails with a connection error if the bus can't be reached, and with a "no provider" error
    /// (see [`Error::is_no_provider`]) if nobody owns the target's service name.
    pub async fn bind(session: &Session, target: Target) -> Result<Self> {
        log::debug!("binding {}", target);
        let binding = session.transport().bind(&target).await?;
        Ok(Self {
            target,
            binding,
            terminated: AtomicBool::new(false),
        })
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn path(&self) -> &OwnedObjectPath {
        &self.target.path
    }

    /// Returns the last known value of property `name`, if it is known and of type `T`.
    pub fn property<T>(&self, name: &str) -> Option<T>
    where
        T: TryFrom<Value<'static>>,
    {
        let value = self.binding.cached_property(name)?;
        decode(&value)
    }

    pub async fn call(&self, method: Method) -> Result<Reply> {
        log::trace!("{}: calling {}", self.target.path.as_str(), method.name());
        self.binding.call(method).await
    }

    pub async fn call_noreply(&self, method: Method) -> Result<()> {
        log::trace!("{}: sending {}", self.target.path.as_str(), method.name());
        self.binding.call_noreply(method).await
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Releases the binding. Calling this again does nothing.
    pub fn terminate(&self) {
        if !self.terminated.swap(true, Ordering::AcqRel) {
            log::debug!("releasing {}", self.target);
            self.binding.release();
        }
    }
}

impl Drop for RemoteObject {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl fmt::Debug for RemoteObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteObject")
            .field("target", &self.target)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

/// Converts a property or signal argument into a concrete type.
pub(crate) fn decode<T>(value: &OwnedValue) -> Option<T>
where
    T: TryFrom<Value<'static>>,
{
    T::try_from((**value).clone()).ok()
}
