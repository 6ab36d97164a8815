//! Scripted stand-ins for the platform seams. Used by the unit tests and by
//! the host build of the sensor firmware.

use std::collections::{HashSet, VecDeque};

use crate::{
    clock::Delay,
    io::{
        ButtonInput, Indicators, Light, LinkError, Network, OutputLine, Outputs, Sensors,
        ServerLink,
    },
    types::HttpReply,
};

#[derive(Debug, Clone)]
pub struct FakeNetwork {
    pub reachable: bool,
    pub link_up: bool,
    pub config_mode: bool,
    pub station_ssid: Option<String>,
    pub hotspot_ssid: Option<String>,
    pub ip: String,
}

impl FakeNetwork {
    /// Station association succeeds; the link is already up.
    pub fn connected() -> Self {
        Self {
            reachable: true,
            link_up: true,
            config_mode: false,
            station_ssid: None,
            hotspot_ssid: None,
            ip: "192.168.1.40".to_string(),
        }
    }

    /// Station association succeeds once started.
    pub fn reachable() -> Self {
        Self {
            link_up: false,
            ..Self::connected()
        }
    }

    pub fn unreachable() -> Self {
        Self {
            reachable: false,
            link_up: false,
            ..Self::connected()
        }
    }

    pub fn hotspot_enabled(&self) -> bool {
        self.hotspot_ssid.is_some()
    }
}

impl Network for FakeNetwork {
    fn is_connected(&self) -> bool {
        self.link_up
    }

    fn in_config_mode(&self) -> bool {
        self.config_mode
    }

    fn begin_station(&mut self, ssid: &str, _password: &str) {
        self.station_ssid = Some(ssid.to_string());
        if self.reachable {
            self.link_up = true;
        }
    }

    fn enable_hotspot(&mut self, ssid: &str, _password: &str) {
        self.hotspot_ssid = Some(ssid.to_string());
        self.config_mode = true;
    }

    fn disable_hotspot(&mut self) {
        self.hotspot_ssid = None;
    }

    fn set_config_mode(&mut self, enabled: bool) {
        self.config_mode = enabled;
    }

    fn local_ip(&self) -> String {
        self.ip.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub method: &'static str,
    pub url: String,
    pub body: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ScriptedServer {
    /// Replies handed out in order; `fallback` once exhausted.
    pub get_replies: VecDeque<Result<HttpReply, LinkError>>,
    pub fallback: Result<HttpReply, LinkError>,
    pub post_reply: Result<HttpReply, LinkError>,
    pub requests: Vec<RecordedRequest>,
}

impl ScriptedServer {
    pub fn answering(body: &str) -> Self {
        Self {
            get_replies: VecDeque::new(),
            fallback: Ok(HttpReply::ok(body)),
            post_reply: Ok(HttpReply::ok(r#"{"success":true}"#)),
            requests: Vec::new(),
        }
    }

    pub fn unreachable() -> Self {
        let down = Err(LinkError::Unreachable("connection refused".to_string()));
        Self {
            get_replies: VecDeque::new(),
            fallback: down.clone(),
            post_reply: down,
            requests: Vec::new(),
        }
    }

    pub fn then(mut self, reply: Result<HttpReply, LinkError>) -> Self {
        self.get_replies.push_back(reply);
        self
    }

    pub fn requests_to(&self, path: &str) -> Vec<&RecordedRequest> {
        self.requests
            .iter()
            .filter(|request| request.url.contains(path))
            .collect()
    }
}

impl ServerLink for ScriptedServer {
    fn get(&mut self, url: &str) -> Result<HttpReply, LinkError> {
        self.requests.push(RecordedRequest {
            method: "GET",
            url: url.to_string(),
            body: None,
        });
        self.get_replies
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }

    fn post_json(&mut self, url: &str, body: &str) -> Result<HttpReply, LinkError> {
        self.requests.push(RecordedRequest {
            method: "POST",
            url: url.to_string(),
            body: Some(body.to_string()),
        });
        self.post_reply.clone()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeSensors {
    pub temperature_c: Option<f32>,
    pub soil_raw: Option<u16>,
    pub temperature_reads: usize,
    pub soil_reads: usize,
}

impl FakeSensors {
    pub fn reading(temperature_c: f32, soil_raw: u16) -> Self {
        Self {
            temperature_c: Some(temperature_c),
            soil_raw: Some(soil_raw),
            ..Self::default()
        }
    }
}

impl Sensors for FakeSensors {
    fn read_temperature_c(&mut self) -> Option<f32> {
        self.temperature_reads += 1;
        self.temperature_c
    }

    fn read_soil_raw(&mut self) -> Option<u16> {
        self.soil_reads += 1;
        self.soil_raw
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordingLights {
    on: HashSet<Light>,
    lit: HashSet<Light>,
}

impl RecordingLights {
    pub fn is_on(&self, light: Light) -> bool {
        self.on.contains(&light)
    }

    pub fn ever_lit(&self, light: Light) -> bool {
        self.lit.contains(&light)
    }
}

impl Indicators for RecordingLights {
    fn set(&mut self, light: Light, on: bool) {
        if on {
            self.on.insert(light);
            self.lit.insert(light);
        } else {
            self.on.remove(&light);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputEvent {
    Set(OutputLine, bool),
    Hold(u64),
}

#[derive(Debug, Clone, Default)]
pub struct RecordingOutputs {
    pub events: Vec<OutputEvent>,
    high: HashSet<OutputLine>,
}

impl RecordingOutputs {
    pub fn is_high(&self, line: OutputLine) -> bool {
        self.high.contains(&line)
    }
}

impl Outputs for RecordingOutputs {
    fn set_line(&mut self, line: OutputLine, high: bool) {
        self.events.push(OutputEvent::Set(line, high));
        if high {
            self.high.insert(line);
        } else {
            self.high.remove(&line);
        }
    }

    fn hold(&mut self, ms: u64) {
        self.events.push(OutputEvent::Hold(ms));
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScriptedButton {
    pressed_samples: Option<u64>,
    taken: u64,
}

impl ScriptedButton {
    pub fn released() -> Self {
        Self::held_for_samples(0)
    }

    pub fn held_for_samples(samples: u64) -> Self {
        Self {
            pressed_samples: Some(samples),
            taken: 0,
        }
    }

    pub fn held_forever() -> Self {
        Self {
            pressed_samples: None,
            taken: 0,
        }
    }

    pub fn samples_taken(&self) -> u64 {
        self.taken
    }
}

impl ButtonInput for ScriptedButton {
    fn is_pressed(&mut self) -> bool {
        let pressed = self.pressed_samples.map_or(true, |held| self.taken < held);
        self.taken += 1;
        pressed
    }
}

/// Delay that returns immediately without advancing any clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDelay;

impl Delay for NoDelay {
    fn delay_ms(&mut self, _ms: u64) {}
}
