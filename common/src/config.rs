use serde::{Deserialize, Serialize};

use crate::led::LedPattern;

/// Longest SSID / passphrase the credential slots can hold (32 bytes including the terminator).
pub const MAX_CREDENTIAL_LEN: usize = 31;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayTimingConfig {
    pub countdown_ms: u64,
    pub warning_ms: u64,
    pub urgent_ms: u64,
    pub debounce_ms: u64,
    pub long_press_ms: u64,
    pub status_publish_interval_ms: u64,
    pub connectivity_check_interval_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for RelayTimingConfig {
    fn default() -> Self {
        Self {
            countdown_ms: 2_400_000,
            warning_ms: 180_000,
            urgent_ms: 30_000,
            debounce_ms: 50,
            long_press_ms: 2_500,
            status_publish_interval_ms: 10_000,
            connectivity_check_interval_ms: 30_000,
            poll_interval_ms: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "broker.hivemq.com".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PinConfig {
    pub led: i32,
    pub switches: [i32; 2],
    pub relays: [i32; 2],
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            led: 2,
            switches: [22, 23],
            relays: [16, 19],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub device_id: String,
    pub timing: RelayTimingConfig,
    pub network: NetworkConfig,
    pub pins: PinConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            device_id: "esp32_timer_relay_01".to_string(),
            timing: RelayTimingConfig::default(),
            network: NetworkConfig::default(),
            pins: PinConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        if self.device_id.trim().is_empty() {
            self.device_id = Self::default().device_id;
        }
        self.timing.sanitize();
        self.network.sanitize();
    }
}

impl RelayTimingConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();

        if self.countdown_ms == 0 {
            self.countdown_ms = defaults.countdown_ms;
        }
        self.warning_ms = self.warning_ms.min(self.countdown_ms);
        self.urgent_ms = self.urgent_ms.min(self.warning_ms);

        if self.status_publish_interval_ms == 0 {
            self.status_publish_interval_ms = defaults.status_publish_interval_ms;
        }
        if self.connectivity_check_interval_ms == 0 {
            self.connectivity_check_interval_ms = defaults.connectivity_check_interval_ms;
        }

        // A slower poll would skip whole LED half-periods.
        let fastest = LedPattern::UrgentBlink.half_period_ms();
        self.poll_interval_ms = self.poll_interval_ms.clamp(1, fastest);
    }
}

impl NetworkConfig {
    pub fn sanitize(&mut self) {
        truncate_credential(&mut self.wifi_ssid);
        truncate_credential(&mut self.wifi_pass);
        if self.mqtt_port == 0 {
            self.mqtt_port = 1883;
        }
    }

    pub fn has_station_credentials(&self) -> bool {
        let ssid = self.wifi_ssid.trim();
        !ssid.is_empty() && ssid != "CHANGE_ME"
    }
}

fn truncate_credential(value: &mut String) {
    if value.len() <= MAX_CREDENTIAL_LEN {
        return;
    }
    let mut end = MAX_CREDENTIAL_LEN;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value.truncate(end);
}
