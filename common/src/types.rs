use serde::{Deserialize, Serialize};

/// Operating mode byte as stored in flash.
///
/// Values outside the known range are carried through as `Unknown` so a read
/// never rewrites what a producer stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum OperatingMode {
    Servo,
    InputSwitch,
    Thermometer,
    SoilSensor,
    Relay,
    RgbLed,
    LatchingValve,
    Unknown(u8),
}

impl OperatingMode {
    pub const DEFAULT: Self = Self::Thermometer;

    pub fn from_byte(value: u8) -> Self {
        match value {
            0 => Self::Servo,
            1 => Self::InputSwitch,
            2 => Self::Thermometer,
            3 => Self::SoilSensor,
            4 => Self::Relay,
            5 => Self::RgbLed,
            6 => Self::LatchingValve,
            other => Self::Unknown(other),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Self::Servo => 0,
            Self::InputSwitch => 1,
            Self::Thermometer => 2,
            Self::SoilSensor => 3,
            Self::Relay => 4,
            Self::RgbLed => 5,
            Self::LatchingValve => 6,
            Self::Unknown(other) => other,
        }
    }

    pub fn is_known(self) -> bool {
        !matches!(self, Self::Unknown(_))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Servo => "SERVO",
            Self::InputSwitch => "INPUT_SWITCH",
            Self::Thermometer => "THERMOMETER",
            Self::SoilSensor => "SOIL_SENSOR",
            Self::Relay => "RELAY",
            Self::RgbLed => "RGB_LED",
            Self::LatchingValve => "LATCHING_VALVE",
            Self::Unknown(_) => "UNKNOWN",
        }
    }
}

impl From<u8> for OperatingMode {
    fn from(value: u8) -> Self {
        Self::from_byte(value)
    }
}

impl From<OperatingMode> for u8 {
    fn from(mode: OperatingMode) -> Self {
        mode.as_byte()
    }
}

/// Stay/sleep answer from the directive endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    StayAwake,
    Sleep,
}

impl Directive {
    /// Only a 200 whose body is exactly `"1"` keeps the node awake.
    pub fn from_reply(status: u16, body: &str) -> Self {
        if status != 200 {
            return Self::Sleep;
        }
        if body == "1" {
            Self::StayAwake
        } else {
            Self::Sleep
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::StayAwake => "STAY_AWAKE",
            Self::Sleep => "SLEEP",
        }
    }
}

/// Reply from one of the remote endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
    /// Epoch milliseconds from the `X-Server-Time` header, when present.
    pub server_time_ms: Option<u64>,
}

impl HttpReply {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            server_time_ms: None,
        }
    }

    pub fn with_server_time(mut self, epoch_ms: u64) -> Self {
        self.server_time_ms = Some(epoch_ms);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrationPayload {
    pub id: String,
    pub alias: String,
    #[serde(rename = "ipAddress")]
    pub ip_address: String,
    #[serde(rename = "macAddress")]
    pub mac_address: String,
    pub mode: OperatingMode,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureReportPayload {
    pub id: String,
    pub alias: String,
    /// The stored log verbatim, e.g. `[1200,98000]`.
    pub failures: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SensorReport {
    #[serde(rename = "temperatureC")]
    pub temperature_c: Option<f32>,
    #[serde(rename = "soilRaw")]
    pub soil_raw: Option<u16>,
    #[serde(rename = "uptimeMs")]
    pub uptime_ms: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StoredConfigView {
    #[serde(rename = "storedSsid")]
    pub stored_ssid: String,
    pub alias: String,
    pub server: String,
    pub mode: OperatingMode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_bytes_pass_through_unknown_values() {
        for byte in 0..=u8::MAX {
            assert_eq!(OperatingMode::from_byte(byte).as_byte(), byte);
        }
        assert_eq!(OperatingMode::from_byte(9), OperatingMode::Unknown(9));
        assert!(!OperatingMode::from_byte(7).is_known());
    }

    #[test]
    fn directive_defaults_to_sleep() {
        assert_eq!(Directive::from_reply(200, "1"), Directive::StayAwake);
        assert_eq!(Directive::from_reply(200, "0"), Directive::Sleep);
        assert_eq!(Directive::from_reply(200, "maybe"), Directive::Sleep);
        assert_eq!(Directive::from_reply(500, "1"), Directive::Sleep);
        assert_eq!(Directive::from_reply(404, ""), Directive::Sleep);
    }

    #[test]
    fn registration_serializes_mode_as_number() {
        let payload = RegistrationPayload {
            id: "LT1AABBCC12345".to_string(),
            alias: "greenhouse".to_string(),
            ip_address: "192.168.1.40".to_string(),
            mac_address: "AA:BB:CC".to_string(),
            mode: OperatingMode::SoilSensor,
        };

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["mode"], 3);
        assert_eq!(json["ipAddress"], "192.168.1.40");
        assert_eq!(json["macAddress"], "AA:BB:CC");
    }
}
