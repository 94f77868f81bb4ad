use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Lowest target temperature the gateway accepts, in °C.
pub const MIN_TEMPERATURE: u8 = 16;
/// Highest target temperature the gateway accepts, in °C.
pub const MAX_TEMPERATURE: u8 = 30;

/// Returns the temperature if it lies in the supported range, `None` otherwise.
pub fn checked_temperature(value: u8) -> Option<u8> {
    (MIN_TEMPERATURE..=MAX_TEMPERATURE)
        .contains(&value)
        .then_some(value)
}

/// Address of one indoor unit, shared by the HTTP and TCP channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DeviceIdentity {
    pub group: u8,
    pub outdoor: u8,
    pub indoor: u8,
}

impl DeviceIdentity {
    pub fn new(group: u8, outdoor: u8, indoor: u8) -> Self {
        Self {
            group,
            outdoor,
            indoor,
        }
    }

    /// Canonical `"{group}_{outdoor}_{indoor}"` key.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.group, self.outdoor, self.indoor)
    }
}

impl FromStr for DeviceIdentity {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || crate::Error::InvalidArgument(format!("invalid device key: {s}"));
        let mut parts = s.split('_').map(|p| p.parse::<u8>().map_err(|_| invalid()));
        let group = parts.next().ok_or_else(invalid)??;
        let outdoor = parts.next().ok_or_else(invalid)??;
        let indoor = parts.next().ok_or_else(invalid)??;
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self::new(group, outdoor, indoor))
    }
}

const MODE_TABLE: &[(u8, HvacMode, &str)] = &[
    (0, HvacMode::Off, "off"),
    (1, HvacMode::Cool, "cool"),
    (2, HvacMode::Dry, "dry"),
    (4, HvacMode::FanOnly, "fan_only"),
    (8, HvacMode::Heat, "heat"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HvacMode {
    Off,
    Cool,
    Dry,
    FanOnly,
    Heat,
    /// A code the gateway sent that has no known meaning.
    Unrecognized(u8),
}

impl HvacMode {
    pub fn from_code(code: u8) -> Self {
        MODE_TABLE
            .iter()
            .find(|(c, _, _)| *c == code)
            .map(|(_, mode, _)| *mode)
            .unwrap_or(HvacMode::Unrecognized(code))
    }

    pub fn code(&self) -> u8 {
        match self {
            HvacMode::Unrecognized(code) => *code,
            known => MODE_TABLE
                .iter()
                .find(|(_, mode, _)| mode == known)
                .map(|(code, _, _)| *code)
                .unwrap_or_default(),
        }
    }

    /// Label for known modes; `None` for `Unrecognized`.
    pub fn as_str(&self) -> Option<&'static str> {
        MODE_TABLE
            .iter()
            .find(|(_, mode, _)| mode == self)
            .map(|(_, _, label)| *label)
    }

    pub fn from_label(s: &str) -> Option<Self> {
        MODE_TABLE
            .iter()
            .find(|(_, _, label)| *label == s)
            .map(|(_, mode, _)| *mode)
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, HvacMode::Unrecognized(_))
    }
}

const FAN_TABLE: &[(u8, FanSpeed, &str)] = &[
    (0, FanSpeed::Auto, "auto"),
    (1, FanSpeed::High, "high"),
    (2, FanSpeed::Medium, "medium"),
    (4, FanSpeed::Low, "low"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FanSpeed {
    Auto,
    High,
    Medium,
    Low,
    Unrecognized(u8),
}

impl FanSpeed {
    pub fn from_code(code: u8) -> Self {
        FAN_TABLE
            .iter()
            .find(|(c, _, _)| *c == code)
            .map(|(_, fan, _)| *fan)
            .unwrap_or(FanSpeed::Unrecognized(code))
    }

    pub fn code(&self) -> u8 {
        match self {
            FanSpeed::Unrecognized(code) => *code,
            known => FAN_TABLE
                .iter()
                .find(|(_, fan, _)| fan == known)
                .map(|(code, _, _)| *code)
                .unwrap_or_default(),
        }
    }

    pub fn as_str(&self) -> Option<&'static str> {
        FAN_TABLE
            .iter()
            .find(|(_, fan, _)| fan == self)
            .map(|(_, _, label)| *label)
    }

    pub fn from_label(s: &str) -> Option<Self> {
        FAN_TABLE
            .iter()
            .find(|(_, _, label)| *label == s)
            .map(|(_, fan, _)| *fan)
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, FanSpeed::Unrecognized(_))
    }
}

/// Which channel produced the most recent update of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Source {
    Http,
    Tcp,
}

/// Fields a unit reports on either channel.
///
/// Temperatures outside 16..=30 °C are held as `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub power: bool,
    pub mode: HvacMode,
    pub fan: FanSpeed,
    pub target_temperature: Option<u8>,
    pub current_temperature: Option<u8>,
    /// Zero when the unit is healthy.
    pub alarm_code: u8,
}

impl StatusReport {
    pub fn has_alarm(&self) -> bool {
        self.alarm_code != 0
    }
}

impl Default for StatusReport {
    fn default() -> Self {
        Self {
            power: false,
            mode: HvacMode::Off,
            fan: FanSpeed::Auto,
            target_temperature: None,
            current_temperature: None,
            alarm_code: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatus {
    pub report: StatusReport,
    /// Handle required by control calls; only the HTTP list supplies it.
    pub control_index: Option<u32>,
    pub last_source: Source,
    pub last_updated: DateTime<Utc>,
    /// Table-wide sequence number of the update that produced this status.
    pub version: u64,
}

impl DeviceStatus {
    /// Same device state, ignoring when and in which order it was applied.
    pub fn same_state(&self, other: &DeviceStatus) -> bool {
        self.report == other.report
            && self.control_index == other.control_index
            && self.last_source == other.last_source
    }
}

/// One entry of the gateway's AC list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitSnapshot {
    pub identity: DeviceIdentity,
    pub control_index: u32,
    pub report: StatusReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BrandInfo {
    pub brand: u16,
    pub protocol: u16,
    /// Number of indoor units the gateway is configured for.
    pub max_devices: u16,
}

impl BrandInfo {
    pub fn name(&self) -> String {
        crate::protocol::brand_name(self.brand, self.protocol)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct GatewayInfo {
    pub model: String,
    pub firmware: String,
    pub hardware_id: String,
    pub brand: BrandInfo,
}

/// Result of a full discovery pass.
#[derive(Debug, Clone)]
pub struct Discovery {
    pub info: GatewayInfo,
    pub devices: Vec<(DeviceIdentity, DeviceStatus)>,
}

/// State of the TCP status listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ListenerState {
    #[default]
    Disconnected,
    Connecting,
    Listening,
}

/// An update applied to the device table.
#[derive(Debug, Clone)]
pub struct DeviceChange {
    pub identity: DeviceIdentity,
    pub previous: Option<DeviceStatus>,
    pub current: DeviceStatus,
}

impl DeviceChange {
    /// Per-field events describing what this update changed.
    pub fn events(&self) -> Vec<Event> {
        crate::diff::status_events(self.identity, self.previous.as_ref(), &self.current)
    }
}

/// Field-level change events derived from a [`DeviceChange`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    DeviceAdded { identity: DeviceIdentity },
    PowerChanged { identity: DeviceIdentity, on: bool },
    ModeChanged { identity: DeviceIdentity, mode: HvacMode },
    FanChanged { identity: DeviceIdentity, fan: FanSpeed },
    TargetTemperatureChanged { identity: DeviceIdentity, temperature: Option<u8> },
    CurrentTemperatureChanged { identity: DeviceIdentity, temperature: Option<u8> },
    AlarmChanged { identity: DeviceIdentity, code: u8 },
    ControlIndexAssigned { identity: DeviceIdentity, index: u32 },
}
