use std::fmt;

use crate::address::ParseAddressError;

/// A result type hardwired to use [`Error`] as its error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Remote error name the daemon's bus reports when the callee is already gone.
pub(crate) const SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";

/// The primary error type used throughout this library.
#[derive(Debug)]
pub struct Error {
    inner: ErrorKind,
}

impl Error {
    pub(crate) fn from(e: impl Into<ErrorKind>) -> Self {
        Self { inner: e.into() }
    }

    pub(crate) fn connection(e: impl Into<ErrorKind>) -> Self {
        Self {
            inner: ErrorKind::Connection(Box::new(e.into())),
        }
    }

    pub(crate) fn no_provider(service: &str) -> Self {
        Self {
            inner: ErrorKind::NoProvider(service.to_string()),
        }
    }

    #[cfg(test)]
    pub(crate) fn remote(name: &str, message: &str) -> Self {
        Self {
            inner: ErrorKind::Remote {
                name: name.to_string(),
                message: Some(message.to_string()),
            },
        }
    }

    /// Returns whether the bus (or the connection to it) could not be reached.
    pub fn is_connection(&self) -> bool {
        matches!(self.inner, ErrorKind::Connection(_))
    }

    /// Returns whether nobody owns the requested service name on the bus.
    ///
    /// This usually means the daemon isn't running.
    pub fn is_no_provider(&self) -> bool {
        matches!(self.inner, ErrorKind::NoProvider(_))
    }

    /// Returns whether a remote call failed because the callee no longer exists.
    pub fn is_service_unknown(&self) -> bool {
        match &self.inner {
            ErrorKind::Remote { name, .. } => name == SERVICE_UNKNOWN,
            ErrorKind::Fdo(zbus::fdo::Error::ServiceUnknown(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

impl std::error::Error for Error {}

#[derive(Debug)]
pub(crate) enum ErrorKind {
    Zbus(zbus::Error),
    Fdo(zbus::fdo::Error),
    Connection(Box<ErrorKind>),
    NoProvider(String),
    Remote {
        name: String,
        message: Option<String>,
    },
    ParseAddressError(ParseAddressError),
    Io(std::io::Error),
    Json(serde_json::Error),
    Other(String),
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Zbus(e) => e.fmt(f),
            ErrorKind::Fdo(e) => e.fmt(f),
            ErrorKind::Connection(e) => write!(f, "failed to connect to the bus: {}", e),
            ErrorKind::NoProvider(name) => {
                write!(f, "no-one is handling {}, is the daemon running?", name)
            }
            ErrorKind::Remote {
                name,
                message: Some(message),
            } => write!(f, "{}: {}", name, message),
            ErrorKind::Remote {
                name,
                message: None,
            } => f.write_str(name),
            ErrorKind::ParseAddressError(e) => e.fmt(f),
            ErrorKind::Io(e) => e.fmt(f),
            ErrorKind::Json(e) => write!(f, "malformed drawing: {}", e),
            ErrorKind::Other(e) => e.fmt(f),
        }
    }
}

impl From<zbus::Error> for ErrorKind {
    fn from(value: zbus::Error) -> Self {
        match value {
            zbus::Error::MethodError(name, message, _) => Self::Remote {
                name: name.to_string(),
                message,
            },
            zbus::Error::FDO(e) => Self::Fdo(*e),
            e => Self::Zbus(e),
        }
    }
}

impl From<zbus::fdo::Error> for ErrorKind {
    fn from(value: zbus::fdo::Error) -> Self {
        Self::Fdo(value)
    }
}

impl From<zbus::zvariant::Error> for ErrorKind {
    fn from(value: zbus::zvariant::Error) -> Self {
        Self::Zbus(zbus::Error::Variant(value))
    }
}

impl From<zbus::names::Error> for ErrorKind {
    fn from(value: zbus::names::Error) -> Self {
        Self::Zbus(zbus::Error::Names(value))
    }
}

impl From<ParseAddressError> for ErrorKind {
    fn from(value: ParseAddressError) -> Self {
        Self::ParseAddressError(value)
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for ErrorKind {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<String> for ErrorKind {
    fn from(value: String) -> Self {
        Self::Other(value)
    }
}

impl From<&str> for ErrorKind {
    fn from(value: &str) -> Self {
        Self::Other(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_unknown() {
        assert!(Error::remote(SERVICE_UNKNOWN, "gone").is_service_unknown());
        let failed = Error::remote("org.freedesktop.DBus.Error.Failed", "nope");
        assert!(!failed.is_service_unknown());
        assert!(!Error::from("other").is_service_unknown());
    }

    #[test]
    fn no_provider_message() {
        let e = Error::no_provider("org.freedesktop.tuhi1");
        assert!(e.is_no_provider());
        assert!(!e.is_connection());
        assert_eq!(
            e.to_string(),
            "no-one is handling org.freedesktop.tuhi1, is the daemon running?"
        );
    }
}
