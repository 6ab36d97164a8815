use core::convert::TryInto;
use std::{
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use ds18b20::{Ds18b20, Resolution};
use embedded_svc::{
    http::{client::Client as HttpClient, Headers, Method, Status},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    adc::{
        attenuation::DB_11,
        oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
        ADC1,
    },
    delay::{Ets, FreeRtos},
    gpio::{
        AnyIOPin, AnyOutputPin, Gpio36, IOPin, Input, InputOutput, Output, OutputPin, PinDriver,
        Pull,
    },
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::{
        client::{Configuration as HttpClientConfiguration, EspHttpConnection},
        server::{Configuration as HttpConfiguration, EspHttpServer},
    },
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use one_wire_bus::{Address, OneWire};
use serde::Serialize;

use omnisensor_common::{
    config::{form_pairs, parse_mode},
    storage::{ERASED, FLASH_SIZE},
    ButtonInput, Clock, ConfigureRequest, Delay, Flash, Gesture, HttpReply, Indicators, Light,
    LinkError, LogicalClock, Network, Node, NodeConfig, NodeIo, OperatingMode, OutputLine,
    Outputs, PersistentStore, Sensors, ServerLink, StoreError, Tick, WakeRecord,
    HEADER_SERVER_TIME, PORTAL_CONFIGURE, PORTAL_CURRENT_CONFIG, PORTAL_INDEX, PORTAL_IS_UP,
    PORTAL_OUTPUT_OFF, PORTAL_OUTPUT_ON, PORTAL_REPORT, PORTAL_SET_MODE,
};

const NVS_NAMESPACE: &str = "omnisensor";
const NVS_IMAGE_KEY: &str = "flash_image";

const BUTTON_PIN: i32 = 4;
const DS18B20_PIN: i32 = 5;
const SOIL_ADC_PIN: i32 = 36;
const SENSE_POWER_PIN: i32 = 14;
const AUX_PIN: i32 = 27;

const MAX_HTTP_BODY: usize = 4096;
const HTTP_TIMEOUT_MS: u64 = 10_000;
const LOOP_PERIOD_MS: u32 = 100;
const RESTART_GRACE_MS: u64 = 500;

const RTC_WAKE_MAGIC: u32 = 0x0A5E_5012;

const PORTAL_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Sensor Setup</title>
  <style>
    body{font-family:Arial,sans-serif;max-width:560px;margin:2rem auto;padding:0 1rem;color:#111}
    label{display:block;margin:.5rem 0 .2rem}
    input,select{width:100%;padding:.5rem;box-sizing:border-box}
    button{padding:.55rem .9rem;margin-top:.8rem}
    .muted{color:#555}
  </style>
</head>
<body>
  <h1>Sensor Setup</h1>
  <p class="muted">Serial number: {{serial}}<br>Alias: {{alias}}</p>
  <form method="post" action="/configure">
    <label>WiFi SSID</label><input name="ssid" type="text" value="{{ssid}}" required>
    <label>WiFi Password</label><input name="password" type="password">
    <label>Alias</label><input name="alias" type="text" value="{{alias}}">
    <label>Server URL</label><input name="server" type="text" value="{{server}}" placeholder="http://192.168.1.10:8000">
    <label>Mode</label>
    <select name="mode">
      <option value="0">Servo</option>
      <option value="1">Input switch</option>
      <option value="2" selected>Thermometer</option>
      <option value="3">Soil sensor</option>
      <option value="4">Relay</option>
      <option value="5">RGB LED</option>
      <option value="6">Latching valve</option>
    </select>
    <button type="submit">Save and restart</button>
  </form>
</body>
</html>
"#;

type SharedNode = Arc<Mutex<Node<NvsFlash>>>;
type SharedBoard = Arc<Mutex<Board>>;
type Request<'a, 'b> =
    esp_idf_svc::http::server::Request<&'a mut esp_idf_svc::http::server::EspHttpConnection<'b>>;

/// Kept in RTC slow memory, which survives deep sleep but not a power cut.
#[derive(Clone, Copy)]
#[repr(C)]
struct RtcWakeRecord {
    magic: u32,
    synced: bool,
    remote_ms: u64,
    local_ms: u64,
    slept_ms: u64,
}

#[link_section = ".rtc.data"]
static mut RTC_WAKE: RtcWakeRecord = RtcWakeRecord {
    magic: 0,
    synced: false,
    remote_ms: 0,
    local_ms: 0,
    slept_ms: 0,
};

/// The whole store image as one NVS blob, rewritten on commit.
struct NvsFlash {
    nvs: EspNvs<NvsDefault>,
    image: Vec<u8>,
}

impl NvsFlash {
    fn open(partition: EspDefaultNvsPartition) -> anyhow::Result<Self> {
        let nvs = EspNvs::new(partition, NVS_NAMESPACE, true)
            .context("failed to open NVS namespace")?;

        let mut image = vec![ERASED; FLASH_SIZE];
        let mut buffer = vec![0_u8; FLASH_SIZE];
        match nvs.get_blob(NVS_IMAGE_KEY, &mut buffer)? {
            Some(stored) => {
                let len = stored.len().min(FLASH_SIZE);
                image[..len].copy_from_slice(&stored[..len]);
            }
            None => info!("no stored image in NVS; starting erased"),
        }

        Ok(Self { nvs, image })
    }
}

impl Flash for NvsFlash {
    fn len(&self) -> usize {
        self.image.len()
    }

    fn read(&self, offset: usize, buf: &mut [u8]) {
        buf.copy_from_slice(&self.image[offset..offset + buf.len()]);
    }

    fn stage(&mut self, offset: usize, data: &[u8]) {
        self.image[offset..offset + data.len()].copy_from_slice(data);
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.nvs
            .set_blob(NVS_IMAGE_KEY, &self.image)
            .map_err(|err| StoreError::Commit(format!("{err:?}")))
    }
}

struct EspNetwork {
    wifi: BlockingWifi<EspWifi<'static>>,
    station: Option<ClientConfiguration>,
    hotspot: Option<AccessPointConfiguration>,
    config_mode: bool,
    hostname: String,
}

impl EspNetwork {
    fn new(wifi: BlockingWifi<EspWifi<'static>>, hostname: String) -> Self {
        Self {
            wifi,
            station: None,
            hotspot: None,
            config_mode: false,
            hostname,
        }
    }

    fn apply_configuration(&mut self) -> anyhow::Result<()> {
        let configuration = match (&self.station, &self.hotspot) {
            (Some(station), Some(hotspot)) => {
                Configuration::Mixed(station.clone(), hotspot.clone())
            }
            (Some(station), None) => Configuration::Client(station.clone()),
            (None, Some(hotspot)) => Configuration::AccessPoint(hotspot.clone()),
            (None, None) => Configuration::None,
        };

        self.wifi.set_configuration(&configuration)?;
        if !self.wifi.is_started()? {
            self.wifi.start()?;
        }
        Ok(())
    }

    fn start_station(&mut self, ssid: &str, password: &str) -> anyhow::Result<()> {
        let auth_method = if password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        self.station = Some(ClientConfiguration {
            ssid: ssid.try_into().map_err(|_| anyhow!("wifi ssid too long"))?,
            password: password
                .try_into()
                .map_err(|_| anyhow!("wifi password too long"))?,
            auth_method,
            ..Default::default()
        });
        self.apply_configuration()?;

        if let Err(err) = self
            .wifi
            .wifi_mut()
            .sta_netif_mut()
            .set_hostname(&self.hostname)
        {
            warn!("failed to set hostname `{}`: {err:?}", self.hostname);
        }

        self.wifi.wifi_mut().connect()?;
        Ok(())
    }

    fn start_hotspot(&mut self, ssid: &str, password: &str) -> anyhow::Result<()> {
        self.hotspot = Some(AccessPointConfiguration {
            ssid: ssid
                .try_into()
                .map_err(|_| anyhow!("hotspot ssid too long"))?,
            password: password
                .try_into()
                .map_err(|_| anyhow!("hotspot password too long"))?,
            auth_method: AuthMethod::WPAWPA2Personal,
            channel: 1,
            ..Default::default()
        });
        self.apply_configuration()?;
        info!("setup hotspot `{ssid}` started");
        Ok(())
    }

    fn mac_address(&self) -> anyhow::Result<String> {
        let mac = self.wifi.wifi().sta_netif().get_mac()?;
        Ok(mac
            .iter()
            .map(|byte| format!("{byte:02X}"))
            .collect::<Vec<_>>()
            .join(":"))
    }
}

impl Network for EspNetwork {
    fn is_connected(&self) -> bool {
        self.wifi.wifi().is_up().unwrap_or(false)
    }

    fn in_config_mode(&self) -> bool {
        self.config_mode
    }

    fn begin_station(&mut self, ssid: &str, password: &str) {
        if let Err(err) = self.start_station(ssid, password) {
            warn!("failed to start wifi station: {err:#}");
        }
    }

    fn enable_hotspot(&mut self, ssid: &str, password: &str) {
        self.config_mode = true;
        if let Err(err) = self.start_hotspot(ssid, password) {
            warn!("failed to start setup hotspot: {err:#}");
        }
    }

    fn disable_hotspot(&mut self) {
        if self.hotspot.take().is_none() {
            return;
        }
        match self.apply_configuration() {
            Ok(()) => info!("setup hotspot stopped"),
            Err(err) => warn!("failed to stop setup hotspot: {err:#}"),
        }
    }

    fn set_config_mode(&mut self, enabled: bool) {
        self.config_mode = enabled;
    }

    fn local_ip(&self) -> String {
        self.wifi
            .wifi()
            .sta_netif()
            .get_ip_info()
            .map(|ip_info| ip_info.ip.to_string())
            .unwrap_or_else(|_| "0.0.0.0".to_string())
    }
}

struct EspServerLink;

impl EspServerLink {
    fn exchange(
        &mut self,
        method: Method,
        url: &str,
        body: Option<&str>,
    ) -> Result<HttpReply, LinkError> {
        let http_conf = HttpClientConfiguration {
            timeout: Some(Duration::from_millis(HTTP_TIMEOUT_MS)),
            ..Default::default()
        };
        let connection = EspHttpConnection::new(&http_conf).map_err(link_error)?;
        let mut client = HttpClient::wrap(connection);

        let content_length = body.map(|body| body.len().to_string());
        let mut headers: Vec<(&str, &str)> = Vec::new();
        if let Some(len) = content_length.as_deref() {
            headers.push(("Content-Type", "application/json"));
            headers.push(("Content-Length", len));
        }

        let mut request = client.request(method, url, &headers).map_err(link_error)?;
        if let Some(body) = body {
            request.write_all(body.as_bytes()).map_err(link_error)?;
            request.flush().map_err(link_error)?;
        }
        let mut response = request.submit().map_err(link_error)?;

        let status = response.status();
        let server_time_ms = response
            .header(HEADER_SERVER_TIME)
            .and_then(|value| value.trim().parse::<u64>().ok());

        let mut received = Vec::new();
        let mut chunk = [0_u8; 512];
        loop {
            let read = response.read(&mut chunk).map_err(link_error)?;
            if read == 0 || received.len() + read > MAX_HTTP_BODY {
                break;
            }
            received.extend_from_slice(&chunk[..read]);
        }

        Ok(HttpReply {
            status,
            body: String::from_utf8_lossy(&received).into_owned(),
            server_time_ms,
        })
    }
}

impl ServerLink for EspServerLink {
    fn get(&mut self, url: &str) -> Result<HttpReply, LinkError> {
        self.exchange(Method::Get, url, None)
    }

    fn post_json(&mut self, url: &str, body: &str) -> Result<HttpReply, LinkError> {
        self.exchange(Method::Post, url, Some(body))
    }
}

fn link_error(err: impl core::fmt::Debug) -> LinkError {
    let message = format!("{err:?}");
    if message.contains("TIMEOUT") || message.contains("EAGAIN") {
        LinkError::Timeout
    } else {
        LinkError::Unreachable(message)
    }
}

type OneWireBus = OneWire<PinDriver<'static, AnyIOPin, InputOutput>>;

/// Everything the portal handlers share with the main loop.
struct Board {
    sensors: EspSensors,
    outputs: EspOutputs,
}

struct EspSensors {
    bus: OneWireBus,
    ds18: Option<Address>,
    soil: AdcChannelDriver<'static, Gpio36, AdcDriver<'static, ADC1>>,
    delay: Ets,
}

impl EspSensors {
    fn new(ds18_pin: AnyIOPin, adc: ADC1, soil_pin: Gpio36) -> anyhow::Result<Self> {
        let mut bus_pin = PinDriver::input_output_od(ds18_pin)?;
        bus_pin.set_pull(Pull::Up)?;
        bus_pin.set_high()?;
        let bus = OneWire::new(bus_pin)
            .map_err(|err| anyhow!("one-wire bus on GPIO{DS18B20_PIN}: {err:?}"))?;

        let soil = AdcChannelDriver::new(
            AdcDriver::new(adc)?,
            soil_pin,
            &AdcChannelConfig {
                attenuation: DB_11,
                ..Default::default()
            },
        )
        .context("failed to initialize soil ADC channel")?;

        let mut sensors = Self {
            bus,
            ds18: None,
            soil,
            delay: Ets,
        };
        sensors.ds18 = scan_for_ds18b20(&mut sensors.bus, &mut sensors.delay);
        Ok(sensors)
    }

    fn measure(&mut self, address: Address) -> Option<f32> {
        let device = Ds18b20::new::<core::convert::Infallible>(address)
            .map_err(|err| warn!("invalid DS18B20 address {address:?}: {err:?}"))
            .ok()?;
        ds18b20::start_simultaneous_temp_measurement(&mut self.bus, &mut self.delay)
            .map_err(|err| warn!("DS18B20 conversion did not start: {err:?}"))
            .ok()?;
        Resolution::Bits12.delay_for_measurement_time(&mut self.delay);
        device
            .read_data(&mut self.bus, &mut self.delay)
            .map(|data| data.temperature)
            .map_err(|err| warn!("DS18B20 read failed: {err:?}"))
            .ok()
    }
}

/// First DS18B20 on the bus. A bus error ends the scan.
fn scan_for_ds18b20(bus: &mut OneWireBus, delay: &mut Ets) -> Option<Address> {
    let found = bus
        .devices(false, delay)
        .map_while(|device| {
            device
                .map_err(|err| warn!("one-wire scan aborted: {err:?}"))
                .ok()
        })
        .find(|address| address.family_code() == ds18b20::FAMILY_CODE);

    match found {
        Some(address) => info!("DS18B20 {address:?} on GPIO{DS18B20_PIN}"),
        None => warn!("no DS18B20 on GPIO{DS18B20_PIN}"),
    }
    found
}

impl Sensors for EspSensors {
    fn read_temperature_c(&mut self) -> Option<f32> {
        if self.ds18.is_none() {
            self.ds18 = scan_for_ds18b20(&mut self.bus, &mut self.delay);
        }
        let address = self.ds18?;

        let reading = self.measure(address);
        if reading.is_none() {
            // Rescan next time; the sensor may have been swapped.
            self.ds18 = None;
        }
        reading
    }

    fn read_soil_raw(&mut self) -> Option<u16> {
        match self.soil.read() {
            Ok(raw) => Some(raw),
            Err(err) => {
                warn!("failed to read soil sensor on GPIO{SOIL_ADC_PIN}: {err:?}");
                None
            }
        }
    }
}

/// Sense-power rail and AUX. Both rest low.
struct EspOutputs {
    sense_power: PinDriver<'static, AnyOutputPin, Output>,
    aux: PinDriver<'static, AnyOutputPin, Output>,
}

impl EspOutputs {
    fn new(sense_power: AnyOutputPin, aux: AnyOutputPin) -> anyhow::Result<Self> {
        let mut outputs = Self {
            sense_power: PinDriver::output(sense_power)?,
            aux: PinDriver::output(aux)?,
        };
        outputs.sense_power.set_low()?;
        outputs.aux.set_low()?;
        Ok(outputs)
    }
}

impl Outputs for EspOutputs {
    fn set_line(&mut self, line: OutputLine, high: bool) {
        let (pin, gpio) = match line {
            OutputLine::SensePower => (&mut self.sense_power, SENSE_POWER_PIN),
            OutputLine::Aux => (&mut self.aux, AUX_PIN),
        };
        let result = if high { pin.set_high() } else { pin.set_low() };
        if let Err(err) = result {
            warn!("failed to drive GPIO{gpio}: {err:?}");
        }
    }

    fn hold(&mut self, ms: u64) {
        FreeRtos::delay_ms(u32::try_from(ms).unwrap_or(u32::MAX));
    }
}

struct EspLights {
    awake: PinDriver<'static, AnyOutputPin, Output>,
    fault: PinDriver<'static, AnyOutputPin, Output>,
}

impl EspLights {
    fn new(awake: AnyOutputPin, fault: AnyOutputPin) -> anyhow::Result<Self> {
        let mut lights = Self {
            awake: PinDriver::output(awake)?,
            fault: PinDriver::output(fault)?,
        };
        lights.awake.set_low()?;
        lights.fault.set_low()?;
        Ok(lights)
    }
}

impl Indicators for EspLights {
    fn set(&mut self, light: Light, on: bool) {
        let pin = match light {
            Light::Awake => &mut self.awake,
            Light::Fault => &mut self.fault,
        };
        let result = if on { pin.set_high() } else { pin.set_low() };
        if let Err(err) = result {
            warn!("failed to drive {light:?} light: {err:?}");
        }
    }
}

/// Active low with the internal pull-up.
struct EspButton {
    pin: PinDriver<'static, AnyIOPin, Input>,
}

impl EspButton {
    fn new(pin: AnyIOPin) -> anyhow::Result<Self> {
        let mut pin = PinDriver::input(pin)?;
        pin.set_pull(Pull::Up)?;
        Ok(Self { pin })
    }
}

impl ButtonInput for EspButton {
    fn is_pressed(&mut self) -> bool {
        self.pin.is_low()
    }
}

struct EspUptime;

impl Clock for EspUptime {
    fn now_ms(&self) -> u64 {
        let micros = unsafe { esp_idf_svc::sys::esp_timer_get_time() };
        u64::try_from(micros / 1000).unwrap_or(0)
    }
}

struct EspDelay;

impl Delay for EspDelay {
    fn delay_ms(&mut self, ms: u64) {
        FreeRtos::delay_ms(u32::try_from(ms).unwrap_or(u32::MAX));
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals {
        modem, pins, adc1, ..
    } = Peripherals::take()?;

    let wake = if woke_from_timer() {
        take_wake_record()
    } else {
        None
    };

    let esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition.clone()))?;
    let wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;

    let flash = ensure_wifi_defaults(NvsFlash::open(nvs_partition)?)?;
    let config = NodeConfig::default();
    let mut network = EspNetwork::new(wifi, String::new());
    let mac_address = network.mac_address().context("failed to read station MAC")?;

    let node = Node::boot(flash, &mac_address, config.clone(), esp_entropy, wake)
        .context("failed to open persistent store")?;
    network.hostname = config.wifi.hostname(node.state.device_id());
    let node: SharedNode = Arc::new(Mutex::new(node));

    let mut server = EspServerLink;
    let board: SharedBoard = Arc::new(Mutex::new(Board {
        sensors: EspSensors::new(pins.gpio5.downgrade(), adc1, pins.gpio36)
            .context("failed to initialize sensors")?,
        outputs: EspOutputs::new(
            pins.gpio14.downgrade_output(),
            pins.gpio27.downgrade_output(),
        )
        .context("failed to initialize output lines")?,
    }));
    let mut lights = EspLights::new(
        pins.gpio13.downgrade_output(),
        pins.gpio12.downgrade_output(),
    )
    .context("failed to initialize indicator lights")?;
    let mut button = EspButton::new(pins.gpio4.downgrade())
        .with_context(|| format!("failed to initialize button on GPIO{BUTTON_PIN}"))?;

    let clock = EspUptime;
    let mut delay = EspDelay;

    let gesture = lock_node(&node)?
        .check_button(&mut button, &clock, &mut delay, &mut lights)
        .context("factory reset failed")?;
    if gesture == Gesture::FactoryReset {
        restart();
    }

    // Keep the portal alive for the program lifetime.
    let _portal = create_portal_server(node.clone(), board.clone())?;

    // Board before node, here and in the portal handlers.
    let decision = {
        let mut board = lock_board(&board)?;
        let Board { sensors, outputs } = &mut *board;
        let mut io = NodeIo {
            network: &mut network,
            server: &mut server,
            sensors,
            outputs,
            lights: &mut lights,
        };
        lock_node(&node)?.start(&clock, &mut delay, &mut io)
    };
    info!("config gate at boot: {}", decision.as_str());

    loop {
        let tick = {
            let mut board = lock_board(&board)?;
            let Board { sensors, outputs } = &mut *board;
            let mut io = NodeIo {
                network: &mut network,
                server: &mut server,
                sensors,
                outputs,
                lights: &mut lights,
            };
            lock_node(&node)?.tick(clock.now_ms(), &mut io)
        };
        match tick {
            Tick::Sleep { duration_ms, wake } => deep_sleep(duration_ms, wake),
            Tick::Restart => restart(),
            Tick::ConfigMode(_) | Tick::StayAwake => {}
        }
        FreeRtos::delay_ms(LOOP_PERIOD_MS);
    }
}

fn lock_node(node: &SharedNode) -> anyhow::Result<MutexGuard<'_, Node<NvsFlash>>> {
    node.lock().map_err(|_| anyhow!("node state lock poisoned"))
}

fn lock_board(board: &SharedBoard) -> anyhow::Result<MutexGuard<'_, Board>> {
    board.lock().map_err(|_| anyhow!("board lock poisoned"))
}

fn create_portal_server(
    node: SharedNode,
    board: SharedBoard,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    {
        let node = node.clone();
        server.fn_handler::<anyhow::Error, _>(PORTAL_INDEX, Method::Get, move |req| {
            let page = {
                let node = lock_node(&node)?;
                let stored = node.store.view();
                PORTAL_HTML
                    .replace("{{serial}}", &html_escape(node.state.serial_number()))
                    .replace("{{alias}}", &html_escape(&stored.alias))
                    .replace("{{ssid}}", &html_escape(&stored.stored_ssid))
                    .replace("{{server}}", &html_escape(&stored.server))
            };
            req.into_response(200, Some("OK"), &[("Content-Type", "text/html; charset=utf-8")])?
                .write_all(page.as_bytes())?;
            Ok(())
        })?;
    }

    server.fn_handler::<anyhow::Error, _>(PORTAL_IS_UP, Method::Get, move |req| {
        write_text(req, 200, "yes")
    })?;

    {
        let node = node.clone();
        server.fn_handler::<anyhow::Error, _>(PORTAL_CONFIGURE, Method::Post, move |mut req| {
            let is_json = req
                .header("Content-Type")
                .is_some_and(|value| value.contains("json"));
            let body = read_request_body(&mut req)?;

            let parsed = if is_json {
                serde_json::from_slice::<ConfigureRequest>(&body)
                    .map_err(|_| "invalid configure payload")
            } else {
                ConfigureRequest::from_form(&String::from_utf8_lossy(&body))
            };
            let request = match parsed.and_then(|request| request.validate().map(|()| request)) {
                Ok(request) => request,
                Err(message) => return write_error(req, 400, message),
            };

            if let Err(err) = lock_node(&node)?.store.apply_configuration(&request) {
                warn!("configure rejected: {err}");
                return write_error(req, 400, &err.to_string());
            }

            info!(
                "configuration saved for `{}` (mode {}); restarting",
                request.ssid, request.mode
            );
            write_text(req, 200, "OK")?;
            schedule_restart()
        })?;
    }

    {
        let node = node.clone();
        server.fn_handler::<anyhow::Error, _>(PORTAL_CURRENT_CONFIG, Method::Get, move |req| {
            let view = lock_node(&node)?.store.view();
            write_json(req, &view)
        })?;
    }

    {
        let node = node.clone();
        let board = board.clone();
        server.fn_handler::<anyhow::Error, _>(PORTAL_REPORT, Method::Get, move |req| {
            {
                let mut board = lock_board(&board)?;
                let Board { sensors, outputs } = &mut *board;
                lock_node(&node)?.report_now(EspUptime.now_ms(), sensors, outputs);
            }
            write_text(req, 200, "OK")
        })?;
    }

    for (path, on) in [(PORTAL_OUTPUT_ON, true), (PORTAL_OUTPUT_OFF, false)] {
        let node = node.clone();
        let board = board.clone();
        server.fn_handler::<anyhow::Error, _>(path, Method::Post, move |req| {
            let action = {
                let mut board = lock_board(&board)?;
                lock_node(&node)?.switch_output(on, &mut board.outputs)
            };
            info!("{path}: {action:?}");
            write_text(req, 200, "OK")
        })?;
    }

    server.fn_handler::<anyhow::Error, _>(PORTAL_SET_MODE, Method::Post, move |mut req| {
        let query = req.uri().split_once('?').map(|(_, query)| query.to_string());
        let body = read_request_body(&mut req)?;

        let mut fields = form_pairs(query.as_deref().unwrap_or(""));
        fields.extend(form_pairs(&String::from_utf8_lossy(&body)));
        let mode = fields
            .iter()
            .rev()
            .find(|(key, _)| key == "mode")
            .map(|(_, value)| parse_mode(value))
            .unwrap_or(Err("mode is required"))
            .map(OperatingMode::from_byte)
            .and_then(|mode| {
                if mode.is_known() {
                    Ok(mode)
                } else {
                    Err("mode must be between 0 and 6")
                }
            });
        let mode = match mode {
            Ok(mode) => mode,
            Err(message) => return write_error(req, 400, message),
        };

        lock_node(&node)?
            .store
            .set_mode(mode)
            .context("failed to store mode")?;
        info!("mode set to {} ({}); restarting", mode.as_byte(), mode.as_str());
        write_text(req, 200, "OK")?;
        schedule_restart()
    })?;

    Ok(server)
}

fn read_request_body(req: &mut Request<'_, '_>) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(req: Request<'_, '_>, payload: &T) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_text(req: Request<'_, '_>, status_code: u16, text: &str) -> anyhow::Result<()> {
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "text/plain; charset=utf-8")],
    )?
    .write_all(text.as_bytes())?;
    Ok(())
}

fn write_error(req: Request<'_, '_>, status_code: u16, message: &str) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn html_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Seeds build-time credentials only when none are stored.
fn ensure_wifi_defaults(flash: NvsFlash) -> anyhow::Result<NvsFlash> {
    let mut store = PersistentStore::new(flash).context("failed to open persistent store")?;

    if !store.has_wifi_credentials() {
        if let Some(ssid) = option_env!("WIFI_SSID").filter(|ssid| !ssid.is_empty()) {
            store
                .save_wifi_credentials(ssid, option_env!("WIFI_PASS").unwrap_or(""))
                .context("failed to seed wifi credentials")?;
            info!("seeded wifi credentials for `{ssid}` from build environment");
        }
    }

    Ok(store.into_flash())
}

fn esp_entropy() -> u32 {
    unsafe { esp_idf_svc::sys::esp_random() }
}

fn woke_from_timer() -> bool {
    let cause = unsafe { esp_idf_svc::sys::esp_sleep_get_wakeup_cause() };
    cause == esp_idf_svc::sys::esp_sleep_source_t_ESP_SLEEP_WAKEUP_TIMER
}

fn take_wake_record() -> Option<WakeRecord> {
    let raw = unsafe { core::ptr::addr_of!(RTC_WAKE).read() };
    unsafe { core::ptr::addr_of_mut!(RTC_WAKE).write(RtcWakeRecord { magic: 0, ..raw }) };

    if raw.magic != RTC_WAKE_MAGIC {
        warn!("timer wake without a sleep record");
        return None;
    }

    let clock = if raw.synced {
        LogicalClock::synced(raw.remote_ms, raw.local_ms)
    } else {
        LogicalClock::unsynchronized()
    };
    Some(WakeRecord {
        clock,
        slept_ms: raw.slept_ms,
    })
}

fn store_wake_record(wake: WakeRecord) {
    let sync = wake.clock.sync_point();
    let record = RtcWakeRecord {
        magic: RTC_WAKE_MAGIC,
        synced: sync.is_some(),
        remote_ms: sync.map_or(0, |sync| sync.remote_ms),
        local_ms: sync.map_or(0, |sync| sync.local_ms),
        slept_ms: wake.slept_ms,
    };
    unsafe { core::ptr::addr_of_mut!(RTC_WAKE).write(record) };
}

fn deep_sleep(duration_ms: u64, wake: WakeRecord) {
    store_wake_record(wake);
    info!("entering deep sleep for {duration_ms}ms");
    unsafe {
        esp_idf_svc::sys::esp_sleep_enable_timer_wakeup(duration_ms.saturating_mul(1000));
        esp_idf_svc::sys::esp_deep_sleep_start();
    }
}

fn restart() {
    warn!("restarting");
    thread::sleep(Duration::from_millis(100));
    unsafe { esp_idf_svc::sys::esp_restart() };
}

fn schedule_restart() -> anyhow::Result<()> {
    thread::Builder::new()
        .name("restart-request".into())
        .spawn(|| {
            thread::sleep(Duration::from_millis(RESTART_GRACE_MS));
            unsafe { esp_idf_svc::sys::esp_restart() };
        })
        .context("failed to spawn restart thread")?;
    Ok(())
}
