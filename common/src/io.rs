//! Seams to the platform: radio, HTTP, sensors, output lines, LEDs and the
//! button.
//!
//! Implementations own their own error handling. Nothing here returns an
//! error the core would have to propagate, except transport failures on the
//! server link, which callers map to a safe default.

use thiserror::Error;

use crate::types::HttpReply;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("server unreachable: {0}")]
    Unreachable(String),
    #[error("request timed out")]
    Timeout,
}

pub trait Network {
    fn is_connected(&self) -> bool;
    fn in_config_mode(&self) -> bool;
    /// Starts station association; completion is observed via `is_connected`.
    fn begin_station(&mut self, ssid: &str, password: &str);
    /// Brings up the setup access point and enters config mode.
    fn enable_hotspot(&mut self, ssid: &str, password: &str);
    fn disable_hotspot(&mut self);
    fn set_config_mode(&mut self, enabled: bool);
    fn local_ip(&self) -> String;
}

pub trait ServerLink {
    fn get(&mut self, url: &str) -> Result<HttpReply, LinkError>;
    fn post_json(&mut self, url: &str, body: &str) -> Result<HttpReply, LinkError>;
}

pub trait Sensors {
    fn read_temperature_c(&mut self) -> Option<f32>;
    fn read_soil_raw(&mut self) -> Option<u16>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Light {
    /// Green: config mode or sleep disabled.
    Awake,
    /// Red: reset progress and fault.
    Fault,
}

pub trait Indicators {
    fn set(&mut self, light: Light, on: bool);
}

pub trait ButtonInput {
    fn is_pressed(&mut self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputLine {
    /// Soil sensor supply; also the low side of the valve H-bridge.
    SensePower,
    /// High side of the valve H-bridge.
    Aux,
}

pub trait Outputs {
    fn set_line(&mut self, line: OutputLine, high: bool);
    /// Blocks with every line held at its current level.
    fn hold(&mut self, ms: u64);
}
