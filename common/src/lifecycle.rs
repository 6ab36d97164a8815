//! Wake/report/sleep scheduling and the boot sequence.
//!
//! The scheduler never touches hardware directly. Each tick returns a [`Tick`]
//! describing what the platform layer should do next, the same way the
//! platform executes sleep and restart only after the core has decided.

use std::collections::HashMap;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    button::{perform_factory_reset, watch_button, Gesture},
    clock::{Clock, Delay, LogicalClock},
    config::{LifecycleConfig, NodeConfig, OutputConfig, WifiConfig},
    device::DeviceState,
    endpoints::{directive_url, endpoint_url, PATH_REGISTER, PATH_WIFI_FAILURES},
    gate::{self, GateDecision, GateInputs},
    io::{ButtonInput, Indicators, Light, Network, Outputs, Sensors, ServerLink},
    outputs::{read_soil_powered, switch_output, OutputAction},
    storage::{Flash, PersistentStore, StoreError},
    types::{Directive, FailureReportPayload, OperatingMode, RegistrationPayload, SensorReport},
};

/// Platform handles borrowed for the duration of one call.
pub struct NodeIo<'a> {
    pub network: &'a mut dyn Network,
    pub server: &'a mut dyn ServerLink,
    pub sensors: &'a mut dyn Sensors,
    pub outputs: &'a mut dyn Outputs,
    pub lights: &'a mut dyn Indicators,
}

/// State carried across a deep sleep in memory that survives it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WakeRecord {
    pub clock: LogicalClock,
    pub slept_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Configuration is incomplete; nothing else ran this tick.
    ConfigMode(GateDecision),
    StayAwake,
    /// Final report sent. The platform should deep sleep and keep `wake`.
    Sleep { duration_ms: u64, wake: WakeRecord },
    /// Uptime limit reached.
    Restart,
}

#[derive(Debug)]
pub struct Scheduler {
    lifecycle: LifecycleConfig,
    wifi: WifiConfig,
    outputs: OutputConfig,
    last_notice_ms: HashMap<GateDecision, u64>,
}

impl Scheduler {
    pub fn new(lifecycle: LifecycleConfig, wifi: WifiConfig, outputs: OutputConfig) -> Self {
        Self {
            lifecycle,
            wifi,
            outputs,
            last_notice_ms: HashMap::new(),
        }
    }

    /// Evaluates the config gate and applies its side effects. Every holding
    /// decision keeps the node awake.
    pub fn check_configuration<F: Flash>(
        &mut self,
        now_ms: u64,
        store: &PersistentStore<F>,
        state: &mut DeviceState,
        io: &mut NodeIo<'_>,
    ) -> GateDecision {
        let in_config_mode = io.network.in_config_mode();
        let decision = gate::evaluate(GateInputs {
            wifi_credentials_present: store.has_wifi_credentials(),
            server_url_present: store.has_server_url(),
            wifi_connected: io.network.is_connected(),
            in_config_mode,
        });

        match decision {
            GateDecision::BroadcastHotspot => {
                self.notice(
                    now_ms,
                    decision,
                    "no wifi credentials; broadcasting setup hotspot",
                );
                if !in_config_mode {
                    io.network.enable_hotspot(
                        &self.wifi.hotspot_ssid(state.device_id()),
                        &self.wifi.hotspot_password,
                    );
                    io.lights.set(Light::Awake, true);
                }
            }
            GateDecision::PassiveConfig => {
                self.notice(now_ms, decision, "no server url; waiting in config mode");
                if !in_config_mode {
                    io.network.set_config_mode(true);
                    io.lights.set(Light::Awake, true);
                }
            }
            GateDecision::AwaitConnectivity => {
                self.notice(now_ms, decision, "configured; waiting for wifi");
            }
            GateDecision::ExitConfigMode => {
                info!("configured and connected; leaving config mode");
                io.network.set_config_mode(false);
                io.network.disable_hotspot();
                io.lights.set(Light::Awake, false);
                self.last_notice_ms.clear();
            }
            GateDecision::Proceed => {}
        }

        if decision.holds_config_mode() {
            state.set_stay_awake(true);
        }
        decision
    }

    pub fn tick<F: Flash>(
        &mut self,
        now_ms: u64,
        store: &PersistentStore<F>,
        state: &mut DeviceState,
        io: &mut NodeIo<'_>,
    ) -> Tick {
        let decision = self.check_configuration(now_ms, store, state, io);
        if decision.holds_config_mode() {
            return Tick::ConfigMode(decision);
        }

        let connected = io.network.is_connected();
        let mut reported = false;

        if state.should_stay_awake() {
            if is_due(now_ms, state.last_send_ms(), self.lifecycle.report_interval_ms) {
                self.report(now_ms, state, io.sensors, io.outputs);
                reported = true;
            }
            if connected
                && is_due(
                    now_ms,
                    state.last_check_ms(),
                    self.lifecycle.directive_poll_interval_ms,
                )
            {
                self.poll_directive(now_ms, store, state, io);
            }
        } else if connected {
            // A poll above that clears stay-awake does not trigger this one;
            // the directive is fetched at most once per tick.
            self.poll_directive(now_ms, store, state, io);
        }

        if !state.should_stay_awake() {
            if !reported {
                self.report(now_ms, state, io.sensors, io.outputs);
            }
            let duration_ms = self.lifecycle.sleep_duration_ms;
            info!("sleeping for {duration_ms}ms");
            return Tick::Sleep {
                duration_ms,
                wake: WakeRecord {
                    clock: state.clock().rebase_for_sleep(now_ms, duration_ms),
                    slept_ms: duration_ms,
                },
            };
        }

        if now_ms > self.lifecycle.max_uptime_ms {
            warn!("uptime {now_ms}ms exceeds limit; restarting");
            return Tick::Restart;
        }

        Tick::StayAwake
    }

    /// Asks the server whether to stay awake. Any failure means sleep.
    pub fn poll_directive<F: Flash>(
        &mut self,
        now_ms: u64,
        store: &PersistentStore<F>,
        state: &mut DeviceState,
        io: &mut NodeIo<'_>,
    ) -> Directive {
        state.mark_check(now_ms);
        let url = directive_url(&store.server_url(), state.serial_number());

        let directive = match io.server.get(&url) {
            Ok(reply) => {
                if let Some(server_ms) = reply.server_time_ms {
                    state.sync_time(server_ms, now_ms);
                }
                Directive::from_reply(reply.status, &reply.body)
            }
            Err(err) => {
                warn!("directive poll failed: {err}");
                Directive::Sleep
            }
        };

        info!("server directive: {}", directive.as_str());
        state.set_stay_awake(directive == Directive::StayAwake);
        directive
    }

    /// Reads the sensors the current mode uses.
    pub fn report(
        &mut self,
        now_ms: u64,
        state: &mut DeviceState,
        sensors: &mut dyn Sensors,
        outputs: &mut dyn Outputs,
    ) -> SensorReport {
        let temperature_c = if state.mode() == OperatingMode::Thermometer {
            sensors.read_temperature_c()
        } else {
            None
        };
        let report = SensorReport {
            temperature_c,
            soil_raw: read_soil_powered(sensors, outputs, &self.outputs),
            uptime_ms: now_ms,
        };
        state.mark_report(now_ms);

        match (report.temperature_c, report.soil_raw) {
            (Some(t), Some(soil)) => info!("temperature {t:.2}C; soil {soil}"),
            (None, Some(soil)) => info!("soil {soil}"),
            (Some(t), None) => info!("temperature {t:.2}C; soil sensor unavailable"),
            (None, None) => warn!("no sensor readings available"),
        }
        report
    }

    /// Boot-time announcement: pending failure log first, then registration.
    pub fn announce<F: Flash>(
        &mut self,
        store: &mut PersistentStore<F>,
        state: &DeviceState,
        io: &mut NodeIo<'_>,
    ) {
        let server_url = store.server_url();
        send_failure_log(&server_url, store, state, io);

        let payload = RegistrationPayload {
            id: state.serial_number().to_string(),
            alias: store.alias(),
            ip_address: io.network.local_ip(),
            mac_address: state.mac_address().to_string(),
            mode: state.mode(),
        };
        let body = match serde_json::to_string(&payload) {
            Ok(body) => body,
            Err(err) => {
                warn!("failed to encode registration: {err}");
                return;
            }
        };

        match io
            .server
            .post_json(&endpoint_url(&server_url, PATH_REGISTER), &body)
        {
            Ok(reply) => info!("registration response {}: {}", reply.status, reply.body),
            Err(err) => warn!("registration failed: {err}"),
        }
    }

    fn notice(&mut self, now_ms: u64, decision: GateDecision, message: &str) {
        let interval = self.lifecycle.config_notice_interval_ms;
        let last = self.last_notice_ms.get(&decision).copied();
        if last.is_none_or(|last| is_due(now_ms, last, interval)) {
            info!("{}: {message}", decision.as_str());
            self.last_notice_ms.insert(decision, now_ms);
        }
    }
}

fn is_due(now_ms: u64, last_ms: u64, interval_ms: u64) -> bool {
    now_ms.saturating_sub(last_ms) >= interval_ms
}

fn send_failure_log<F: Flash>(
    server_url: &str,
    store: &mut PersistentStore<F>,
    state: &DeviceState,
    io: &mut NodeIo<'_>,
) {
    let failures = store.wifi_failure_log();
    if failures.is_empty() || failures == "[]" {
        info!("no wifi failures to report");
        return;
    }

    let payload = FailureReportPayload {
        id: state.serial_number().to_string(),
        alias: store.alias(),
        failures,
    };
    let body = match serde_json::to_string(&payload) {
        Ok(body) => body,
        Err(err) => {
            warn!("failed to encode failure report: {err}");
            return;
        }
    };

    match io
        .server
        .post_json(&endpoint_url(server_url, PATH_WIFI_FAILURES), &body)
    {
        Ok(reply) if reply.status == 200 => {
            info!("wifi failure log delivered");
            if let Err(err) = store.clear_wifi_failure_log() {
                warn!("failed to clear wifi failure log: {err}");
            }
        }
        Ok(reply) => warn!("failure log rejected with {}; keeping it", reply.status),
        Err(err) => warn!("failure log not delivered: {err}; keeping it"),
    }
}

/// Top-level owner of everything that lives for one boot.
#[derive(Debug)]
pub struct Node<F: Flash> {
    pub store: PersistentStore<F>,
    pub state: DeviceState,
    pub scheduler: Scheduler,
    pub config: NodeConfig,
}

impl<F: Flash> Node<F> {
    /// Store first, then identity, then the scheduler.
    pub fn boot(
        flash: F,
        mac_address: &str,
        config: NodeConfig,
        entropy: impl FnOnce() -> u32,
        wake: Option<WakeRecord>,
    ) -> Result<Self, StoreError> {
        let mut store = PersistentStore::new(flash)?;
        let mut state = DeviceState::boot(&mut store, mac_address, &config.identity, entropy)?;
        if let Some(wake) = wake {
            info!("woke from {}ms sleep", wake.slept_ms);
            state.resume_clock(wake.clock, wake.slept_ms);
        }
        let scheduler = Scheduler::new(
            config.lifecycle.clone(),
            config.wifi.clone(),
            config.outputs.clone(),
        );

        Ok(Self {
            store,
            state,
            scheduler,
            config,
        })
    }

    /// Watches the button at boot. Returns `FactoryReset` once the store is
    /// cleared; the caller restarts.
    pub fn check_button(
        &mut self,
        button: &mut dyn ButtonInput,
        clock: &dyn Clock,
        delay: &mut dyn Delay,
        lights: &mut dyn Indicators,
    ) -> Result<Gesture, StoreError> {
        let gesture = watch_button(
            button,
            clock,
            delay,
            lights,
            &mut self.state,
            &self.config.button,
        );
        if gesture == Gesture::FactoryReset {
            perform_factory_reset(&mut self.store, lights, delay, &self.config.button)?;
        }
        Ok(gesture)
    }

    /// Config gate, station connect and announcement.
    pub fn start(
        &mut self,
        clock: &dyn Clock,
        delay: &mut dyn Delay,
        io: &mut NodeIo<'_>,
    ) -> GateDecision {
        let decision =
            self.scheduler
                .check_configuration(clock.now_ms(), &self.store, &mut self.state, io);

        if self.store.has_wifi_credentials() && !io.network.is_connected() {
            let ssid = self.store.ssid();
            let password = self.store.password();
            if !gate::connect_station(io.network, delay, &self.config.wifi, &ssid, &password) {
                self.record_connect_failure(clock.now_ms(), io);
            }
        }

        if self.store.has_server_url() && io.network.is_connected() {
            self.scheduler.announce(&mut self.store, &self.state, io);
        }
        decision
    }

    pub fn tick(&mut self, now_ms: u64, io: &mut NodeIo<'_>) -> Tick {
        self.scheduler.tick(now_ms, &self.store, &mut self.state, io)
    }

    /// On-demand report; restarts the report interval.
    pub fn report_now(
        &mut self,
        now_ms: u64,
        sensors: &mut dyn Sensors,
        outputs: &mut dyn Outputs,
    ) -> SensorReport {
        self.scheduler.report(now_ms, &mut self.state, sensors, outputs)
    }

    pub fn switch_output(&self, on: bool, outputs: &mut dyn Outputs) -> OutputAction {
        switch_output(self.state.mode(), on, outputs, &self.config.outputs)
    }

    fn record_connect_failure(&mut self, now_ms: u64, io: &mut NodeIo<'_>) {
        let timestamp = self.state.timestamp_ms(now_ms);
        if let Err(err) = self.store.add_wifi_failure(timestamp) {
            warn!("failed to record wifi failure: {err}");
        }

        let wifi = &self.config.wifi;
        io.network.enable_hotspot(
            &wifi.hotspot_ssid(self.state.device_id()),
            &wifi.hotspot_password,
        );
        io.lights.set(Light::Awake, true);
        self.state.set_stay_awake(true);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        clock::ManualClock,
        config::ConfigureRequest,
        io::{LinkError, OutputLine},
        sim::{
            FakeNetwork, FakeSensors, OutputEvent, RecordingLights, RecordingOutputs,
            ScriptedButton, ScriptedServer,
        },
        storage::MemoryFlash,
        types::HttpReply,
    };

    const MAC: &str = "AA:BB:CC:DD:EE:FF";

    struct Rig {
        network: FakeNetwork,
        server: ScriptedServer,
        sensors: FakeSensors,
        outputs: RecordingOutputs,
        lights: RecordingLights,
    }

    impl Rig {
        fn new(network: FakeNetwork, server: ScriptedServer) -> Self {
            Self {
                network,
                server,
                sensors: FakeSensors::reading(21.5, 1_800),
                outputs: RecordingOutputs::default(),
                lights: RecordingLights::default(),
            }
        }

        fn io(&mut self) -> NodeIo<'_> {
            NodeIo {
                network: &mut self.network,
                server: &mut self.server,
                sensors: &mut self.sensors,
                outputs: &mut self.outputs,
                lights: &mut self.lights,
            }
        }
    }

    fn configured_flash(mode: u8) -> MemoryFlash {
        let mut store = PersistentStore::new(MemoryFlash::default()).unwrap();
        store
            .apply_configuration(&ConfigureRequest {
                ssid: "garden".to_string(),
                password: "hunter22".to_string(),
                alias: "bed 3".to_string(),
                server: "http://10.0.0.2:8000".to_string(),
                mode,
            })
            .unwrap();
        store.into_flash()
    }

    fn boot(flash: MemoryFlash) -> Node<MemoryFlash> {
        Node::boot(flash, MAC, NodeConfig::default(), || 7, None).unwrap()
    }

    #[test]
    fn fresh_device_generates_id_once() {
        let node = boot(MemoryFlash::default());
        let id = node.state.device_id();
        assert!((10_000..=65_535).contains(&id));

        let flash = node.store.into_flash();
        let again = Node::boot(flash, MAC, NodeConfig::default(), || 99, None).unwrap();
        assert_eq!(again.state.device_id(), id);
    }

    #[test]
    fn missing_credentials_broadcast_hotspot() {
        let mut node = boot(MemoryFlash::default());
        let mut rig = Rig::new(FakeNetwork::unreachable(), ScriptedServer::answering("1"));

        let tick = node.tick(5_000, &mut rig.io());

        assert_eq!(tick, Tick::ConfigMode(GateDecision::BroadcastHotspot));
        assert_eq!(rig.network.hotspot_ssid.as_deref(), Some("WiFiSense_10007"));
        assert!(rig.lights.is_on(Light::Awake));
        assert!(rig.server.requests.is_empty());
        assert_eq!(rig.sensors.soil_reads, 0);
        assert!(node.state.should_stay_awake());
    }

    #[test]
    fn credentials_without_server_stay_passive() {
        let mut store = PersistentStore::new(MemoryFlash::default()).unwrap();
        store.save_wifi_credentials("garden", "hunter22").unwrap();
        let mut node = boot(store.into_flash());
        let mut rig = Rig::new(FakeNetwork::connected(), ScriptedServer::answering("1"));

        let tick = node.tick(1_000, &mut rig.io());

        assert_eq!(tick, Tick::ConfigMode(GateDecision::PassiveConfig));
        assert!(rig.network.config_mode);
        assert!(!rig.network.hotspot_enabled());
        assert!(rig.server.requests.is_empty());
    }

    #[test]
    fn connected_config_mode_exits_and_runs_cycle() {
        let mut node = boot(configured_flash(2));
        let mut network = FakeNetwork::connected();
        network.enable_hotspot("WiFiSense_10007", "password");
        let mut rig = Rig::new(network, ScriptedServer::answering("1"));
        rig.lights.set(Light::Awake, true);

        let tick = node.tick(1_000, &mut rig.io());

        assert_eq!(tick, Tick::StayAwake);
        assert!(!rig.network.config_mode);
        assert!(!rig.network.hotspot_enabled());
        assert!(!rig.lights.is_on(Light::Awake));
        assert_eq!(rig.server.requests_to("/should-remain-awake").len(), 1);
    }

    #[test]
    fn awake_node_reports_once_per_tick() {
        let mut node = boot(configured_flash(2));
        node.state.set_stay_awake(true);
        let mut rig = Rig::new(FakeNetwork::connected(), ScriptedServer::answering("1"));

        assert_eq!(node.tick(31_000, &mut rig.io()), Tick::StayAwake);
        assert_eq!(rig.sensors.soil_reads, 1);
        assert_eq!(rig.server.requests.len(), 1);

        assert_eq!(node.tick(31_010, &mut rig.io()), Tick::StayAwake);
        assert_eq!(rig.sensors.soil_reads, 1);
        assert_eq!(rig.server.requests.len(), 1);

        assert_eq!(node.tick(61_000, &mut rig.io()), Tick::StayAwake);
        assert_eq!(rig.sensors.soil_reads, 2);
        assert_eq!(rig.server.requests.len(), 2);
    }

    #[test]
    fn awake_node_released_by_server_reports_and_polls_once() {
        let mut node = boot(configured_flash(2));
        node.state.set_stay_awake(true);
        let mut rig = Rig::new(FakeNetwork::connected(), ScriptedServer::answering("0"));

        let tick = node.tick(31_000, &mut rig.io());

        assert!(matches!(tick, Tick::Sleep { duration_ms: 60_000, .. }));
        assert_eq!(rig.sensors.soil_reads, 1);
        assert_eq!(rig.server.requests.len(), 1);
    }

    #[test]
    fn server_zero_means_sleep() {
        let mut node = boot(configured_flash(2));
        let mut rig = Rig::new(FakeNetwork::connected(), ScriptedServer::answering("0"));

        let tick = node.tick(2_000, &mut rig.io());

        assert_eq!(
            tick,
            Tick::Sleep {
                duration_ms: 60_000,
                wake: WakeRecord {
                    clock: LogicalClock::unsynchronized(),
                    slept_ms: 60_000,
                },
            }
        );
        assert_eq!(rig.sensors.soil_reads, 1);
        assert_eq!(
            rig.server.requests[0].url,
            "http://10.0.0.2:8000/should-remain-awake?id=LT1AABBCCDDEEFF10007"
        );
    }

    #[test]
    fn unreachable_server_means_sleep() {
        let mut node = boot(configured_flash(2));
        let mut rig = Rig::new(FakeNetwork::connected(), ScriptedServer::unreachable());

        assert!(matches!(node.tick(2_000, &mut rig.io()), Tick::Sleep { .. }));
        assert!(!node.state.should_stay_awake());
    }

    #[test]
    fn timed_out_poll_means_sleep() {
        let mut node = boot(configured_flash(2));
        let server = ScriptedServer::answering("1").then(Err(LinkError::Timeout));
        let mut rig = Rig::new(FakeNetwork::connected(), server);

        assert!(matches!(node.tick(2_000, &mut rig.io()), Tick::Sleep { .. }));
    }

    #[test]
    fn server_one_keeps_node_awake() {
        let mut node = boot(configured_flash(2));
        let mut rig = Rig::new(FakeNetwork::connected(), ScriptedServer::answering("1"));

        assert_eq!(node.tick(2_000, &mut rig.io()), Tick::StayAwake);
        assert!(node.state.should_stay_awake());
        assert_eq!(rig.sensors.soil_reads, 0);
    }

    #[test]
    fn directive_is_polled_on_its_own_interval() {
        let mut node = boot(configured_flash(2));
        let mut rig = Rig::new(FakeNetwork::connected(), ScriptedServer::answering("1"));

        node.tick(2_000, &mut rig.io());
        node.tick(20_000, &mut rig.io());
        assert_eq!(rig.server.requests_to("/should-remain-awake").len(), 1);

        node.tick(32_000, &mut rig.io());
        assert_eq!(rig.server.requests_to("/should-remain-awake").len(), 2);
    }

    #[test]
    fn held_awake_survives_sleep_directive() {
        let mut node = boot(configured_flash(2));
        node.state.hold_awake();
        let mut rig = Rig::new(FakeNetwork::connected(), ScriptedServer::answering("0"));

        assert_eq!(node.tick(31_000, &mut rig.io()), Tick::StayAwake);
        assert_eq!(rig.server.requests.len(), 1);
    }

    #[test]
    fn disconnected_node_reports_and_sleeps_without_polling() {
        let mut node = boot(configured_flash(2));
        let mut rig = Rig::new(FakeNetwork::reachable(), ScriptedServer::answering("1"));

        assert!(matches!(node.tick(2_000, &mut rig.io()), Tick::Sleep { .. }));
        assert!(rig.server.requests.is_empty());
        assert_eq!(rig.sensors.soil_reads, 1);
    }

    #[test]
    fn uptime_limit_restarts() {
        let mut node = boot(configured_flash(2));
        let mut rig = Rig::new(FakeNetwork::connected(), ScriptedServer::answering("1"));

        assert_eq!(node.tick(86_400_001, &mut rig.io()), Tick::Restart);
    }

    #[test]
    fn thermometer_mode_reads_temperature() {
        let mut node = boot(configured_flash(2));
        let mut rig = Rig::new(FakeNetwork::connected(), ScriptedServer::answering("0"));

        let report = node.report_now(4_000, &mut rig.sensors, &mut rig.outputs);

        assert_eq!(
            report,
            SensorReport {
                temperature_c: Some(21.5),
                soil_raw: Some(1_800),
                uptime_ms: 4_000,
            }
        );
        assert_eq!(node.state.last_send_ms(), 4_000);
    }

    #[test]
    fn other_modes_skip_temperature() {
        let mut node = boot(configured_flash(3));
        let mut rig = Rig::new(FakeNetwork::connected(), ScriptedServer::answering("0"));

        let report = node.report_now(4_000, &mut rig.sensors, &mut rig.outputs);

        assert_eq!(report.temperature_c, None);
        assert_eq!(rig.sensors.temperature_reads, 0);
        assert_eq!(rig.sensors.soil_reads, 1);
    }

    #[test]
    fn report_powers_soil_sensor_only_while_reading() {
        let mut node = boot(configured_flash(3));
        let mut rig = Rig::new(FakeNetwork::connected(), ScriptedServer::answering("0"));

        let tick = node.tick(2_000, &mut rig.io());

        assert!(matches!(tick, Tick::Sleep { .. }));
        assert_eq!(
            rig.outputs.events,
            vec![
                OutputEvent::Set(OutputLine::SensePower, true),
                OutputEvent::Hold(100),
                OutputEvent::Set(OutputLine::SensePower, false),
            ]
        );
    }

    #[test]
    fn on_demand_report_restarts_report_interval() {
        let mut node = boot(configured_flash(2));
        node.state.set_stay_awake(true);
        let mut rig = Rig::new(FakeNetwork::connected(), ScriptedServer::answering("1"));

        node.report_now(40_000, &mut rig.sensors, &mut rig.outputs);
        assert_eq!(node.tick(41_000, &mut rig.io()), Tick::StayAwake);

        assert_eq!(rig.sensors.soil_reads, 1);
        assert_eq!(node.state.last_send_ms(), 40_000);
    }

    #[test]
    fn output_requests_follow_mode() {
        let mut outputs = RecordingOutputs::default();

        let relay = boot(configured_flash(4));
        assert_eq!(
            relay.switch_output(true, &mut outputs),
            OutputAction::SensePower { on: true }
        );
        assert!(outputs.is_high(OutputLine::SensePower));

        let valve = boot(configured_flash(6));
        assert_eq!(
            valve.switch_output(true, &mut outputs),
            OutputAction::ValvePulse { open: true }
        );
        assert!(!outputs.is_high(OutputLine::SensePower));
        assert!(!outputs.is_high(OutputLine::Aux));
    }

    #[test]
    fn server_time_syncs_and_carries_across_sleep() {
        let mut node = boot(configured_flash(2));
        let server = ScriptedServer::answering("0")
            .then(Ok(HttpReply::ok("0").with_server_time(1_700_000_000_000)));
        let mut rig = Rig::new(FakeNetwork::connected(), server);

        let tick = node.tick(3_000, &mut rig.io());

        let Tick::Sleep { wake, .. } = tick else {
            panic!("expected sleep, got {tick:?}");
        };
        assert_eq!(wake.clock, LogicalClock::synced(1_700_000_060_000, 0));

        let flash = node.store.into_flash();
        let resumed = Node::boot(flash, MAC, NodeConfig::default(), || 1, Some(wake)).unwrap();
        assert_eq!(resumed.state.timestamp_ms(500), 1_700_000_060_500);
        assert_eq!(resumed.state.sleep_duration_ms(), 60_000);
    }

    #[test]
    fn start_announces_failures_then_registers() {
        let mut store = PersistentStore::new(configured_flash(1)).unwrap();
        store.add_wifi_failure(1_200).unwrap();
        let mut node = boot(store.into_flash());
        let clock = ManualClock::new(0);
        let mut delay = &clock;
        let mut rig = Rig::new(FakeNetwork::reachable(), ScriptedServer::answering("1"));

        let decision = node.start(&clock, &mut delay, &mut rig.io());

        assert_eq!(decision, GateDecision::Proceed);
        let urls: Vec<&str> = rig.server.requests.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(
            urls,
            vec!["http://10.0.0.2:8000/wifi-failures", "http://10.0.0.2:8000/register"]
        );

        let failures: serde_json::Value =
            serde_json::from_str(rig.server.requests[0].body.as_deref().unwrap()).unwrap();
        assert_eq!(failures["failures"], "[1200]");
        assert_eq!(failures["alias"], "bed 3");

        let registration: serde_json::Value =
            serde_json::from_str(rig.server.requests[1].body.as_deref().unwrap()).unwrap();
        assert_eq!(registration["id"], "LT1AABBCCDDEEFF10007");
        assert_eq!(registration["ipAddress"], "192.168.1.40");
        assert_eq!(registration["macAddress"], MAC);
        assert_eq!(registration["mode"], 1);

        assert_eq!(node.store.wifi_failure_log(), "");
    }

    #[test]
    fn failure_log_kept_when_server_rejects_it() {
        let mut store = PersistentStore::new(configured_flash(1)).unwrap();
        store.add_wifi_failure(1_200).unwrap();
        let mut node = boot(store.into_flash());
        let mut server = ScriptedServer::answering("1");
        server.post_reply = Ok(HttpReply {
            status: 500,
            body: "oops".to_string(),
            server_time_ms: None,
        });
        let mut rig = Rig::new(FakeNetwork::connected(), server);

        node.scheduler.announce(&mut node.store, &node.state, &mut rig.io());

        assert_eq!(node.store.wifi_failures(), vec![1_200]);
        assert_eq!(rig.server.requests_to("/register").len(), 1);
    }

    #[test]
    fn empty_failure_log_is_not_sent() {
        let mut node = boot(configured_flash(1));
        let mut rig = Rig::new(FakeNetwork::connected(), ScriptedServer::answering("1"));

        node.scheduler.announce(&mut node.store, &node.state, &mut rig.io());

        assert!(rig.server.requests_to("/wifi-failures").is_empty());
        assert_eq!(rig.server.requests_to("/register").len(), 1);
    }

    #[test]
    fn failed_connect_records_failure_and_opens_hotspot() {
        let mut node = boot(configured_flash(1));
        let clock = ManualClock::new(0);
        let mut delay = &clock;
        let mut rig = Rig::new(FakeNetwork::unreachable(), ScriptedServer::answering("1"));

        node.start(&clock, &mut delay, &mut rig.io());

        assert_eq!(node.store.wifi_failures(), vec![30_000]);
        assert_eq!(rig.network.hotspot_ssid.as_deref(), Some("WiFiSense_10007"));
        assert!(rig.lights.is_on(Light::Awake));
        assert!(node.state.should_stay_awake());
        assert!(rig.server.requests.is_empty());

        let tick = node.tick(clock.now_ms(), &mut rig.io());
        assert_eq!(tick, Tick::ConfigMode(GateDecision::AwaitConnectivity));
    }

    #[test]
    fn button_long_press_clears_configuration() {
        let mut node = boot(configured_flash(1));
        let id = node.state.device_id();
        let clock = ManualClock::new(0);
        let mut delay = &clock;
        let mut button = ScriptedButton::held_forever();
        let mut lights = RecordingLights::default();

        let gesture = node
            .check_button(&mut button, &clock, &mut delay, &mut lights)
            .unwrap();

        assert_eq!(gesture, Gesture::FactoryReset);
        assert!(!node.store.has_wifi_credentials());
        assert!(!node.store.has_server_url());
        assert_eq!(node.store.device_id(), id);
    }
}
