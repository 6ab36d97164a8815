use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::{bail, Context};
use tracing::info;

use omnisensor_common::{
    clock::ManualClock,
    sim::{
        FakeNetwork, FakeSensors, RecordingLights, RecordingOutputs, ScriptedButton,
        ScriptedServer,
    },
    storage::{ERASED, FLASH_SIZE},
    Clock, ConfigureRequest, Flash, Gesture, Node, NodeConfig, NodeIo, PersistentStore, StoreError,
    Tick, WakeRecord,
};

/// Flash image persisted to a file on every commit.
struct FileFlash {
    path: PathBuf,
    image: Vec<u8>,
}

impl FileFlash {
    fn open(path: &Path) -> anyhow::Result<Self> {
        let mut image = match std::fs::read(path) {
            Ok(image) => image,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!("no flash image at {}; starting erased", path.display());
                Vec::new()
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        image.resize(FLASH_SIZE, ERASED);

        Ok(Self {
            path: path.to_path_buf(),
            image,
        })
    }
}

impl Flash for FileFlash {
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
        std::fs::write(&self.path, &self.image).map_err(|err| StoreError::Commit(err.to_string()))
    }
}

struct HostSettings {
    flash_path: PathBuf,
    mac_address: String,
    wifi_connected: bool,
    directive: String,
    cycles: u32,
    tick_ms: u64,
    configure: Option<ConfigureRequest>,
}

impl HostSettings {
    fn from_env() -> anyhow::Result<Self> {
        let configure = match std::env::var("NODE_CONFIGURE") {
            Ok(json) => Some(
                serde_json::from_str::<ConfigureRequest>(&json)
                    .context("NODE_CONFIGURE is not a valid configure request")?,
            ),
            Err(_) => None,
        };

        Ok(Self {
            flash_path: std::env::var("NODE_FLASH_PATH")
                .unwrap_or_else(|_| "omnisensor-flash.bin".to_string())
                .into(),
            mac_address: std::env::var("NODE_MAC")
                .unwrap_or_else(|_| "24:6F:28:AA:01:9C".to_string()),
            wifi_connected: std::env::var("NODE_WIFI_CONNECTED")
                .map(|value| value != "0" && !value.eq_ignore_ascii_case("false"))
                .unwrap_or(true),
            directive: std::env::var("NODE_DIRECTIVE").unwrap_or_else(|_| "0".to_string()),
            cycles: std::env::var("NODE_CYCLES")
                .ok()
                .and_then(|value| value.parse::<u32>().ok())
                .unwrap_or(3),
            tick_ms: std::env::var("NODE_TICK_MS")
                .ok()
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(1_000),
            configure,
        })
    }
}

enum BootEnd {
    Sleep(WakeRecord),
    Restart,
    Interrupted,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = HostSettings::from_env()?;
    info!(
        "host node simulation: flash {}, mac {}, {} cycle(s)",
        settings.flash_path.display(),
        settings.mac_address,
        settings.cycles
    );

    let mut wake: Option<WakeRecord> = None;
    for cycle in 1..=settings.cycles {
        info!("boot {cycle}/{}", settings.cycles);
        match boot_once(&settings, wake.take()).await? {
            BootEnd::Sleep(record) => {
                info!("deep sleep for {}ms (simulated)", record.slept_ms);
                wake = Some(record);
            }
            BootEnd::Restart => info!("restarting (simulated)"),
            BootEnd::Interrupted => {
                info!("interrupted; stopping simulation");
                break;
            }
        }
    }

    Ok(())
}

async fn boot_once(settings: &HostSettings, wake: Option<WakeRecord>) -> anyhow::Result<BootEnd> {
    let mut flash = FileFlash::open(&settings.flash_path)?;
    if let Some(request) = &settings.configure {
        flash = apply_configure(flash, request)?;
    }
    let mut node = Node::boot(
        flash,
        &settings.mac_address,
        NodeConfig::default(),
        entropy,
        wake,
    )
    .context("failed to open persistent store")?;

    let clock = ManualClock::new(0);
    let mut delay = &clock;
    let mut network = if settings.wifi_connected {
        FakeNetwork::reachable()
    } else {
        FakeNetwork::unreachable()
    };
    let mut server = ScriptedServer::answering(&settings.directive);
    let mut sensors = FakeSensors::reading(21.5, 1_820);
    let mut outputs = RecordingOutputs::default();
    let mut lights = RecordingLights::default();

    if wake.is_none() {
        let mut button = ScriptedButton::released();
        let gesture = node
            .check_button(&mut button, &clock, &mut delay, &mut lights)
            .context("factory reset failed")?;
        if gesture == Gesture::FactoryReset {
            return Ok(BootEnd::Restart);
        }
    }

    let mut io = NodeIo {
        network: &mut network,
        server: &mut server,
        sensors: &mut sensors,
        outputs: &mut outputs,
        lights: &mut lights,
    };
    let decision = node.start(&clock, &mut delay, &mut io);
    info!("config gate at boot: {}", decision.as_str());

    let mut interval = tokio::time::interval(Duration::from_millis(100));
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => return Ok(BootEnd::Interrupted),
        }

        clock.advance(settings.tick_ms);
        match node.tick(clock.now_ms(), &mut io) {
            Tick::Sleep { wake, .. } => return Ok(BootEnd::Sleep(wake)),
            Tick::Restart => return Ok(BootEnd::Restart),
            Tick::ConfigMode(_) | Tick::StayAwake => {}
        }
    }
}

/// Stands in for a setup portal submission.
fn apply_configure(flash: FileFlash, request: &ConfigureRequest) -> anyhow::Result<FileFlash> {
    if let Err(message) = request.validate() {
        bail!("rejected configure request: {message}");
    }

    let mut store = PersistentStore::new(flash).context("failed to open persistent store")?;
    let stored = store.view();
    let unchanged = store.has_wifi_credentials()
        && stored.stored_ssid == request.ssid
        && stored.alias == request.alias
        && stored.server == request.server
        && stored.mode == request.operating_mode();
    if !unchanged {
        store
            .apply_configuration(request)
            .context("failed to store configuration")?;
        info!("configuration applied from NODE_CONFIGURE");
    }

    Ok(store.into_flash())
}

fn entropy() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.subsec_nanos() ^ std::process::id())
        .unwrap_or_else(|_| std::process::id())
}
