use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};

use crate::{storage::MAX_STRING_LEN, types::OperatingMode};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    pub report_interval_ms: u64,
    pub directive_poll_interval_ms: u64,
    pub sleep_duration_ms: u64,
    pub max_uptime_ms: u64,
    pub config_notice_interval_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            report_interval_ms: 30_000,
            directive_poll_interval_ms: 30_000,
            sleep_duration_ms: 60_000,
            max_uptime_ms: 86_400_000,
            config_notice_interval_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ButtonConfig {
    pub wake_threshold_ms: u64,
    pub reset_threshold_ms: u64,
    pub max_flash_interval_ms: u64,
    pub min_flash_interval_ms: u64,
    pub flash_exponent: f32,
    pub sample_period_ms: u64,
    pub fault_hold_ms: u64,
}

impl Default for ButtonConfig {
    fn default() -> Self {
        Self {
            wake_threshold_ms: 1_000,
            reset_threshold_ms: 10_000,
            max_flash_interval_ms: 500,
            min_flash_interval_ms: 25,
            flash_exponent: 2.5,
            sample_period_ms: 10,
            fault_hold_ms: 1_000,
        }
    }
}

impl ButtonConfig {
    /// Upper bound on samples taken while the button is held.
    pub fn max_samples(&self) -> u64 {
        self.reset_threshold_ms / self.sample_period_ms.max(1) + 1
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WifiConfig {
    pub connect_attempts: u32,
    pub retry_delay_ms: u64,
    pub hotspot_ssid_prefix: String,
    pub hotspot_password: String,
    pub hostname_prefix: String,
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 60,
            retry_delay_ms: 500,
            hotspot_ssid_prefix: "WiFiSense_".to_string(),
            hotspot_password: "password".to_string(),
            hostname_prefix: "WiFi_Omni_".to_string(),
        }
    }
}

impl WifiConfig {
    pub fn hotspot_ssid(&self, device_id: u16) -> String {
        format!("{}{}", self.hotspot_ssid_prefix, device_id)
    }

    pub fn hostname(&self, device_id: u16) -> String {
        format!("{}{}", self.hostname_prefix, device_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Soil sensor power-up time before the ADC read.
    pub soil_settle_ms: u64,
    pub valve_pulse_ms: u64,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            soil_settle_ms: 100,
            valve_pulse_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    pub serial_prefix: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            serial_prefix: "LT1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    pub lifecycle: LifecycleConfig,
    pub button: ButtonConfig,
    pub wifi: WifiConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub outputs: OutputConfig,
}

/// Settings submitted through the setup portal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigureRequest {
    pub ssid: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub alias: String,
    pub server: String,
    pub mode: u8,
}

impl ConfigureRequest {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.ssid.trim().is_empty() {
            return Err("ssid cannot be empty");
        }
        if self.ssid.len() > MAX_STRING_LEN {
            return Err("ssid is too long");
        }
        if self.password.len() > MAX_STRING_LEN {
            return Err("password is too long");
        }
        if self.alias.len() > MAX_STRING_LEN {
            return Err("alias is too long");
        }
        if self.server.len() > MAX_STRING_LEN {
            return Err("server is too long");
        }
        if !self.operating_mode().is_known() {
            return Err("mode must be between 0 and 6");
        }

        Ok(())
    }

    pub fn operating_mode(&self) -> OperatingMode {
        OperatingMode::from_byte(self.mode)
    }

    /// Parses an `application/x-www-form-urlencoded` portal submission.
    /// A missing `mode` falls back to the default mode.
    pub fn from_form(body: &str) -> Result<Self, &'static str> {
        let mut request = Self {
            ssid: String::new(),
            password: String::new(),
            alias: String::new(),
            server: String::new(),
            mode: OperatingMode::DEFAULT.as_byte(),
        };

        for (key, value) in form_pairs(body) {
            match key.as_str() {
                "ssid" => request.ssid = value,
                "password" => request.password = value,
                "alias" => request.alias = value,
                "server" => request.server = value,
                "mode" => request.mode = parse_mode(&value)?,
                _ => {}
            }
        }

        Ok(request)
    }
}

pub fn parse_mode(value: &str) -> Result<u8, &'static str> {
    value
        .trim()
        .parse::<u8>()
        .map_err(|_| "mode must be between 0 and 6")
}

pub fn form_pairs(body: &str) -> Vec<(String, String)> {
    body.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_form_component(key), decode_form_component(value))
        })
        .collect()
}

fn decode_form_component(input: &str) -> String {
    let spaced = input.replace('+', " ");
    percent_decode_str(&spaced).decode_utf8_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ConfigureRequest {
        ConfigureRequest {
            ssid: "garden".to_string(),
            password: "hunter22".to_string(),
            alias: "bed 3".to_string(),
            server: "http://192.168.1.10:8000".to_string(),
            mode: 3,
        }
    }

    #[test]
    fn accepts_complete_request() {
        assert_eq!(request().validate(), Ok(()));
        assert_eq!(request().operating_mode(), OperatingMode::SoilSensor);
    }

    #[test]
    fn rejects_out_of_range_mode_at_write_boundary() {
        let mut req = request();
        req.mode = 7;
        assert_eq!(req.validate(), Err("mode must be between 0 and 6"));
    }

    #[test]
    fn rejects_oversized_strings() {
        let mut req = request();
        req.alias = "a".repeat(MAX_STRING_LEN + 1);
        assert_eq!(req.validate(), Err("alias is too long"));

        let mut req = request();
        req.ssid = "  ".to_string();
        assert_eq!(req.validate(), Err("ssid cannot be empty"));
    }

    #[test]
    fn parses_portal_form() {
        let body = concat!(
            "ssid=my+garden&password=p%26ss%2Bword&alias=bed%203",
            "&server=http%3A%2F%2F10.0.0.2%3A8000&mode=3"
        );
        let req = ConfigureRequest::from_form(body).unwrap();

        assert_eq!(
            req,
            ConfigureRequest {
                ssid: "my garden".to_string(),
                password: "p&ss+word".to_string(),
                alias: "bed 3".to_string(),
                server: "http://10.0.0.2:8000".to_string(),
                mode: 3,
            }
        );
    }

    #[test]
    fn form_without_mode_uses_default() {
        let req = ConfigureRequest::from_form("ssid=garden&server=http://x").unwrap();
        assert_eq!(req.operating_mode(), OperatingMode::DEFAULT);
        assert_eq!(req.password, "");
    }

    #[test]
    fn form_rejects_non_numeric_mode() {
        assert_eq!(
            ConfigureRequest::from_form("ssid=garden&mode=soil"),
            Err("mode must be between 0 and 6")
        );
        assert_eq!(parse_mode(" 6 "), Ok(6));
    }

    #[test]
    fn hotspot_names_carry_device_id() {
        let wifi = WifiConfig::default();
        assert_eq!(wifi.hotspot_ssid(48213), "WiFiSense_48213");
        assert_eq!(wifi.hostname(48213), "WiFi_Omni_48213");
    }
}
