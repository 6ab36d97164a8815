use log::info;

use crate::{
    clock::LogicalClock,
    config::IdentityConfig,
    storage::{Flash, PersistentStore, StoreError},
    types::OperatingMode,
};

const DEVICE_ID_MIN: u16 = 10_000;

/// Maps raw entropy onto a five-digit id that still fits the 16-bit slot.
pub fn generate_device_id(raw: u32) -> u16 {
    let span = u32::from(u16::MAX - DEVICE_ID_MIN) + 1;
    DEVICE_ID_MIN + (raw % span) as u16
}

pub fn serial_number(prefix: &str, mac_address: &str, device_id: u16) -> String {
    format!("{prefix}{mac_address}{device_id}").replace(':', "")
}

/// Boot-scoped runtime record. Rebuilt from the store on every wake.
#[derive(Debug, Clone)]
pub struct DeviceState {
    device_id: u16,
    serial_number: String,
    mac_address: String,
    mode: OperatingMode,
    stay_awake: bool,
    awake_held: bool,
    last_send_ms: u64,
    last_check_ms: u64,
    clock: LogicalClock,
    sleep_duration_ms: u64,
}

impl DeviceState {
    /// Loads identity and mode, generating and persisting the device id on
    /// first boot.
    pub fn boot<F: Flash>(
        store: &mut PersistentStore<F>,
        mac_address: &str,
        identity: &IdentityConfig,
        entropy: impl FnOnce() -> u32,
    ) -> Result<Self, StoreError> {
        if !store.has_device_id() {
            let id = generate_device_id(entropy());
            info!("first start; generated device id {id}");
            store.set_device_id(id)?;
        }

        let device_id = store.device_id();
        let mode = store.mode();
        let serial_number = serial_number(&identity.serial_prefix, mac_address, device_id);
        info!(
            "device {device_id} ({serial_number}) loaded in mode {} ({})",
            mode.as_byte(),
            mode.as_str()
        );

        Ok(Self {
            device_id,
            serial_number,
            mac_address: mac_address.to_string(),
            mode,
            stay_awake: false,
            awake_held: false,
            last_send_ms: 0,
            last_check_ms: 0,
            clock: LogicalClock::unsynchronized(),
            sleep_duration_ms: 0,
        })
    }

    pub fn device_id(&self) -> u16 {
        self.device_id
    }

    pub fn serial_number(&self) -> &str {
        &self.serial_number
    }

    pub fn mac_address(&self) -> &str {
        &self.mac_address
    }

    pub fn mode(&self) -> OperatingMode {
        self.mode
    }

    pub fn should_stay_awake(&self) -> bool {
        self.stay_awake || self.awake_held
    }

    pub fn set_stay_awake(&mut self, awake: bool) {
        self.stay_awake = awake;
    }

    /// Button override; survives server directives until the next boot.
    pub fn hold_awake(&mut self) {
        self.awake_held = true;
        self.stay_awake = true;
    }

    pub fn is_awake_held(&self) -> bool {
        self.awake_held
    }

    pub fn last_send_ms(&self) -> u64 {
        self.last_send_ms
    }

    pub fn mark_report(&mut self, now_ms: u64) {
        self.last_send_ms = now_ms;
    }

    pub fn last_check_ms(&self) -> u64 {
        self.last_check_ms
    }

    pub fn mark_check(&mut self, now_ms: u64) {
        self.last_check_ms = now_ms;
    }

    pub fn clock(&self) -> &LogicalClock {
        &self.clock
    }

    /// Restores the clock carried over from before a timer wake.
    pub fn resume_clock(&mut self, clock: LogicalClock, slept_ms: u64) {
        self.clock = clock;
        self.sleep_duration_ms = slept_ms;
    }

    pub fn sync_time(&mut self, server_ms: u64, local_ms: u64) {
        self.clock.sync(server_ms, local_ms);
    }

    pub fn is_time_synchronized(&self) -> bool {
        self.clock.is_synchronized()
    }

    /// Logical time when synchronized, otherwise uptime.
    pub fn timestamp_ms(&self, local_ms: u64) -> u64 {
        self.clock.now(local_ms).unwrap_or(local_ms)
    }

    pub fn sleep_duration_ms(&self) -> u64 {
        self.sleep_duration_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryFlash;

    #[test]
    fn generated_ids_are_five_digits() {
        for raw in [0, 1, 55_535, 55_536, u32::MAX, 3_141_592_653] {
            let id = generate_device_id(raw);
            assert!((10_000..=65_535).contains(&id), "{id}");
        }
        assert_eq!(generate_device_id(0), 10_000);
        assert_eq!(generate_device_id(55_535), 65_535);
    }

    #[test]
    fn serial_strips_separators() {
        assert_eq!(
            serial_number("LT1", "24:6F:28:AA:01:9C", 48_213),
            "LT1246F28AA019C48213"
        );
    }

    #[test]
    fn first_boot_persists_id_once() {
        let mut store = PersistentStore::new(MemoryFlash::default()).unwrap();
        let identity = IdentityConfig::default();

        let first = DeviceState::boot(&mut store, "AA:BB", &identity, || 7).unwrap();
        let second = DeviceState::boot(&mut store, "AA:BB", &identity, || {
            panic!("id must not be regenerated")
        })
        .unwrap();

        assert_eq!(first.device_id(), 10_007);
        assert_eq!(second.device_id(), first.device_id());
        assert_eq!(second.serial_number(), "LT1AABB10007");
        assert_eq!(second.mode(), OperatingMode::Thermometer);
    }

    #[test]
    fn held_awake_ignores_directive_clear() {
        let mut store = PersistentStore::new(MemoryFlash::default()).unwrap();
        let mut state =
            DeviceState::boot(&mut store, "AA", &IdentityConfig::default(), || 1).unwrap();

        state.hold_awake();
        state.set_stay_awake(false);

        assert!(state.should_stay_awake());
        assert!(state.is_awake_held());
    }

    #[test]
    fn timestamp_falls_back_to_uptime() {
        let mut store = PersistentStore::new(MemoryFlash::default()).unwrap();
        let mut state =
            DeviceState::boot(&mut store, "AA", &IdentityConfig::default(), || 1).unwrap();

        assert_eq!(state.timestamp_ms(1_500), 1_500);
        state.sync_time(9_000_000, 1_000);
        assert!(state.is_time_synchronized());
        assert_eq!(state.timestamp_ms(1_500), 9_000_500);
    }
}
