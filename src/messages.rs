use serde::{Deserialize, Serialize};

use crate::config::ModelProfile;

/// Plotter power state as exposed on the status endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    /// No USB session could be established.
    Off,
    /// USB session alive, motor power absent.
    Connected,
    /// Motor rail powered; motion is possible.
    On,
}

impl PowerState {
    pub fn as_str(self) -> &'static str {
        match self {
            PowerState::Off => "off",
            PowerState::Connected => "connected",
            PowerState::On => "on",
        }
    }
}

/// How a device identifier was interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityKind {
    /// A raw OS port path (no nickname assigned on the device).
    PortPath,
    /// A human-assigned device label.
    Nickname,
}

/// Identity of an enumerated plotter, derived transiently during a probe.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceIdentity {
    pub raw_label: String,
    pub kind: IdentityKind,
    /// Human-readable machine type resolved from the label.
    pub machine: String,
    pub model_number: Option<u32>,
}

/// One status probe result, the `/status.json` body.
///
/// Never cached across requests: power state is physical and can change
/// between polls.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub status: PowerState,
    pub machine: String,
    pub device_info: Option<String>,
    pub model_number: Option<u32>,
    pub config: ModelProfile,
    pub voltage: Option<i32>,
}

impl StatusReport {
    /// Report for "no plotter present".
    pub fn off() -> Self {
        Self {
            status: PowerState::Off,
            machine: "none".to_string(),
            device_info: None,
            model_number: None,
            config: ModelProfile::default(),
            voltage: None,
        }
    }
}
