use serde::{Deserialize, Serialize};

use crate::protocol::{HEARTBEAT_PORT, SHUTDOWN_PORT, WAKE_PORT};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub heartbeat_timeout_ms: u64,
    pub wake_grace_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 2_000,
            wake_grace_ms: 30_000,
            poll_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ButtonConfig {
    pub double_tap_ms: u64,
    pub long_press_ms: u64,
    pub debounce_ms: u64,
}

impl Default for ButtonConfig {
    fn default() -> Self {
        Self {
            double_tap_ms: 500,
            long_press_ms: 3_000,
            debounce_ms: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub broadcast_addr: [u8; 4],
    pub heartbeat_port: u16,
    pub wake_port: u16,
    pub shutdown_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            broadcast_addr: [255, 255, 255, 255],
            heartbeat_port: HEARTBEAT_PORT,
            wake_port: WAKE_PORT,
            shutdown_port: SHUTDOWN_PORT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HardwareConfig {
    pub led_pin: i32,
    pub button_pin: i32,
    pub button_active_low: bool,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            led_pin: 8,
            button_pin: 3,
            button_active_low: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub button: ButtonConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub hardware: HardwareConfig,
}

impl PresenceConfig {
    pub fn sanitize(&mut self) {
        self.heartbeat_timeout_ms = self.heartbeat_timeout_ms.clamp(500, 60_000);
        self.wake_grace_ms = self.wake_grace_ms.clamp(1_000, 600_000);
        self.poll_interval_ms = self.poll_interval_ms.clamp(10, 1_000);
    }
}

impl ButtonConfig {
    pub fn sanitize(&mut self) {
        self.double_tap_ms = self.double_tap_ms.clamp(100, 2_000);
        self.debounce_ms = self.debounce_ms.clamp(5, 200);
        // A long press must outlast the double-tap window.
        self.long_press_ms = self.long_press_ms.clamp(self.double_tap_ms + 500, 10_000);
    }
}

impl NetworkConfig {
    pub fn sanitize(&mut self) {
        if self.heartbeat_port == 0 {
            self.heartbeat_port = HEARTBEAT_PORT;
        }
        if self.wake_port == 0 {
            self.wake_port = WAKE_PORT;
        }
        if self.shutdown_port == 0 {
            self.shutdown_port = SHUTDOWN_PORT;
        }
        if self.mqtt_port == 0 {
            self.mqtt_port = 1883;
        }
    }
}

impl HardwareConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        if self.led_pin < 0 {
            self.led_pin = defaults.led_pin;
        }
        if self.button_pin < 0 {
            self.button_pin = defaults.button_pin;
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.presence.sanitize();
        self.button.sanitize();
        self.network.sanitize();
        self.hardware.sanitize();
    }
}
