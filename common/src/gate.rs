use log::{info, warn};

use crate::{clock::Delay, config::WifiConfig, io::Network};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateInputs {
    pub wifi_credentials_present: bool,
    pub server_url_present: bool,
    pub wifi_connected: bool,
    pub in_config_mode: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GateDecision {
    /// No credentials: broadcast the setup hotspot.
    BroadcastHotspot,
    /// Credentials but no server: config mode without hotspot so the station
    /// link stays usable for setup.
    PassiveConfig,
    /// Everything configured and connected; leave config mode.
    ExitConfigMode,
    /// Everything configured, still waiting for the station link.
    AwaitConnectivity,
    Proceed,
}

impl GateDecision {
    pub fn holds_config_mode(self) -> bool {
        matches!(
            self,
            Self::BroadcastHotspot | Self::PassiveConfig | Self::AwaitConnectivity
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::BroadcastHotspot => "BROADCAST_HOTSPOT",
            Self::PassiveConfig => "PASSIVE_CONFIG",
            Self::ExitConfigMode => "EXIT_CONFIG_MODE",
            Self::AwaitConnectivity => "AWAIT_CONNECTIVITY",
            Self::Proceed => "PROCEED",
        }
    }
}

pub fn evaluate(inputs: GateInputs) -> GateDecision {
    if !inputs.wifi_credentials_present {
        return GateDecision::BroadcastHotspot;
    }
    if !inputs.server_url_present {
        return GateDecision::PassiveConfig;
    }
    match (inputs.in_config_mode, inputs.wifi_connected) {
        (true, true) => GateDecision::ExitConfigMode,
        (true, false) => GateDecision::AwaitConnectivity,
        (false, _) => GateDecision::Proceed,
    }
}

/// Starts association and polls for the link, bounded by `connect_attempts`.
pub fn connect_station(
    network: &mut dyn Network,
    delay: &mut dyn Delay,
    wifi: &WifiConfig,
    ssid: &str,
    password: &str,
) -> bool {
    info!("connecting to `{ssid}`");
    network.begin_station(ssid, password);

    for attempt in 1..=wifi.connect_attempts {
        if network.is_connected() {
            info!("wifi connected on attempt {attempt}; ip {}", network.local_ip());
            return true;
        }
        delay.delay_ms(wifi.retry_delay_ms);
    }

    if network.is_connected() {
        info!("wifi connected; ip {}", network.local_ip());
        return true;
    }

    warn!(
        "wifi connection to `{ssid}` failed after {} attempts",
        wifi.connect_attempts
    );
    false
}
