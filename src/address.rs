//! Bluetooth hardware addresses.
//!
//! The daemon identifies a tablet by the address of its BlueZ device. The address is the only
//! identity that survives daemon restarts (object paths may not), so [`Device`] equality is
//! defined in terms of it.
//!
//! [`Device`]: crate::device::Device

use core::fmt;
use std::{fmt::Write, num::ParseIntError, str::FromStr};

use serde::{Serialize, Serializer};

/// A 6-Byte Bluetooth device address.
///
/// Parsing is case-insensitive; the [`Display`](fmt::Display) form uses upper case hex digits,
/// matching the `Address` property BlueZ exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address([u8; 6]);

impl Address {
    #[inline]
    pub fn from_bytes(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl From<[u8; 6]> for Address {
    #[inline]
    fn from(value: [u8; 6]) -> Self {
        Self(value)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i != 0 {
                f.write_char(':')?;
            }

            write!(f, "{:02X}", byte)?;
        }

        Ok(())
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Parses an [`Address`] from a colon-separated hex string.
///
/// Example: `aa:ff:00:33:22:11`
impl FromStr for Address {
    type Err = ParseAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0; 6];
        for (i, s) in s.splitn(6, ':').enumerate() {
            if s.len() != 2 {
                return Err(ParseAddressError::other());
            }
            bytes[i] = u8::from_str_radix(s, 16).map_err(ParseAddressError::parse_int)?;
            if i == bytes.len() - 1 {
                return Ok(Address(bytes));
            }
        }

        Err(ParseAddressError::other())
    }
}

/// The error type returned by the [`FromStr`] implementation of [`Address`].
#[derive(Debug)]
pub struct ParseAddressError(ParseAddressErrorKind);

impl fmt::Display for ParseAddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            ParseAddressErrorKind::ParseInt(e) => write!(f, "invalid device address: {}", e),
            ParseAddressErrorKind::Other => f.write_str("invalid device address"),
        }
    }
}

impl std::error::Error for ParseAddressError {}

#[derive(Debug)]
enum ParseAddressErrorKind {
    ParseInt(ParseIntError),
    Other,
}

impl ParseAddressError {
    fn parse_int(e: ParseIntError) -> Self {
        Self(ParseAddressErrorKind::ParseInt(e))
    }

    fn other() -> Self {
        Self(ParseAddressErrorKind::Other)
    }
}
