use serde::{Deserialize, Serialize};

use crate::error::CommandError;

pub const CHANNEL_COUNT: usize = 2;

/// A validated relay channel number (1 or 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u8);

impl ChannelId {
    pub const ONE: Self = Self(1);
    pub const TWO: Self = Self(2);
    pub const ALL: [Self; CHANNEL_COUNT] = [Self::ONE, Self::TWO];

    pub fn index(self) -> usize {
        usize::from(self.0 - 1)
    }
}

impl TryFrom<i64> for ChannelId {
    type Error = CommandError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::ONE),
            2 => Ok(Self::TWO),
            other => Err(CommandError::InvalidChannel(other)),
        }
    }
}

impl TryFrom<u8> for ChannelId {
    type Error = CommandError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::try_from(i64::from(value))
    }
}

impl core::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "relay{}", self.0)
    }
}

/// How close an active channel is to its deadline, least urgent first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Urgency {
    Off,
    Normal,
    Warning,
    Urgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_seconds: Option<u64>,
}

impl ChannelStatus {
    pub fn inactive() -> Self {
        Self {
            active: false,
            remaining_seconds: None,
        }
    }

    pub fn active(remaining_seconds: u64) -> Self {
        Self {
            active: true,
            remaining_seconds: Some(remaining_seconds),
        }
    }
}

/// Point-in-time view of both channels, each read under its own lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub relay1: ChannelStatus,
    pub relay2: ChannelStatus,
}

impl StatusSnapshot {
    pub fn channel(&self, channel: ChannelId) -> ChannelStatus {
        match channel.index() {
            0 => self.relay1,
            _ => self.relay2,
        }
    }
}

/// Payload served on `/api/status` and published on the status topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub device_id: String,
    pub wifi_connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wifi_rssi: Option<i32>,
    pub relay1: ChannelStatus,
    pub relay2: ChannelStatus,
}

impl DeviceStatus {
    pub fn new(
        device_id: &str,
        wifi_connected: bool,
        wifi_rssi: Option<i32>,
        snapshot: StatusSnapshot,
    ) -> Self {
        Self {
            device_id: device_id.to_string(),
            wifi_connected,
            wifi_rssi,
            relay1: snapshot.relay1,
            relay2: snapshot.relay2,
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            relay1: self.relay1,
            relay2: self.relay2,
        }
    }
}
