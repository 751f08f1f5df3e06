//! Response bodies of the REST API.

use serde::Serialize;

use crate::{address::Address, device::BatteryState, Device};

/// A device as returned by the API.
///
/// Search results only carry the identity; the remaining fields are left out of the JSON.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceView {
    pub id: Address,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_state: Option<BatteryState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_listening: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_in_live_mode: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drawings: Option<Vec<serde_json::Value>>,
}

impl DeviceView {
    /// Identity only, as listed by a search.
    pub fn brief(device: &Device) -> Self {
        Self {
            id: device.address(),
            name: device.name().unwrap_or_default(),
            width: None,
            height: None,
            battery: None,
            battery_state: None,
            is_listening: None,
            is_in_live_mode: None,
            drawings: None,
        }
    }

    /// Everything known about a registered device, with its drawings already fetched.
    pub fn full(device: &Device, drawings: Vec<serde_json::Value>) -> Self {
        let (width, height) = device.dimensions().unwrap_or((0, 0));
        Self {
            width: Some(width),
            height: Some(height),
            battery: Some(device.battery_percent().unwrap_or(0)),
            battery_state: Some(device.battery_state()),
            is_listening: Some(device.is_listening()),
            is_in_live_mode: Some(device.is_live()),
            drawings: Some(drawings),
            ..Self::brief(device)
        }
    }
}

/// Status body for operations that don't return data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiResponse {
    pub code: u16,
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

impl ApiResponse {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        let kind = match code {
            200..=299 => "success",
            _ => "error",
        };
        Self {
            code,
            kind: kind.to_string(),
            message: message.into(),
        }
    }
}
