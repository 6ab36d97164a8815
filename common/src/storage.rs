//! Fixed-layout configuration record kept in a flash-backed byte image.
//!
//! Erased flash reads back as `0xFF`, so every field treats that byte as
//! "never written". String regions are a length byte followed by the payload;
//! a length of `0xFF` is uninitialized, a length of `0` is an erased entry.

use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    config::ConfigureRequest,
    types::{OperatingMode, StoredConfigView},
};

pub const ERASED: u8 = 0xFF;
pub const STRING_REGION_LEN: usize = 256;
/// A 255-byte payload would collide with the erased length byte.
pub const MAX_STRING_LEN: usize = STRING_REGION_LEN - 2;

const DEVICE_ID_SET: u8 = 1;
const WIFI_CREDENTIALS_SET: u8 = 233;
const WIFI_CREDENTIALS_CLEARED: u8 = 0;

pub mod layout {
    use super::STRING_REGION_LEN;

    pub const DEVICE_ID_PRESENT: usize = 100;
    pub const DEVICE_ID: usize = 101;
    pub const WIFI_CREDENTIALS_PRESENT: usize = 103;
    pub const OPERATING_MODE: usize = 200;
    pub const ALIAS: usize = 256;
    pub const SERVER_URL: usize = ALIAS + STRING_REGION_LEN;
    pub const SSID: usize = SERVER_URL + STRING_REGION_LEN;
    pub const PASSWORD: usize = SSID + STRING_REGION_LEN;
    pub const FAILURE_LOG: usize = PASSWORD + STRING_REGION_LEN;
    pub const END: usize = FAILURE_LOG + STRING_REGION_LEN;

    pub const STRING_REGIONS: [usize; 5] = [ALIAS, SERVER_URL, SSID, PASSWORD, FAILURE_LOG];
}

/// The length-prefixed string fields. Only these offsets hold strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringRegion {
    Alias,
    ServerUrl,
    Ssid,
    Password,
    FailureLog,
}

impl StringRegion {
    pub const ALL: [Self; 5] = [
        Self::Alias,
        Self::ServerUrl,
        Self::Ssid,
        Self::Password,
        Self::FailureLog,
    ];

    pub fn offset(self) -> usize {
        match self {
            Self::Alias => layout::ALIAS,
            Self::ServerUrl => layout::SERVER_URL,
            Self::Ssid => layout::SSID,
            Self::Password => layout::PASSWORD,
            Self::FailureLog => layout::FAILURE_LOG,
        }
    }
}

/// Size of the image the platform back ends allocate.
pub const FLASH_SIZE: usize = 2048;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("value of {len} bytes exceeds the {max}-byte string region")]
    Capacity { len: usize, max: usize },
    #[error("flash image of {len} bytes is smaller than the {required}-byte layout")]
    RegionTooSmall { len: usize, required: usize },
    #[error("flash commit failed: {0}")]
    Commit(String),
}

/// Byte-addressable flash image with an explicit commit step.
///
/// `stage` only touches the in-RAM copy; nothing is durable until `commit`.
pub trait Flash {
    fn len(&self) -> usize;
    fn read(&self, offset: usize, buf: &mut [u8]);
    fn stage(&mut self, offset: usize, data: &[u8]);
    fn commit(&mut self) -> Result<(), StoreError>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_byte(&self, offset: usize) -> u8 {
        let mut byte = [ERASED];
        self.read(offset, &mut byte);
        byte[0]
    }
}

/// RAM-only image, used by tests and the host simulation.
#[derive(Debug, Clone)]
pub struct MemoryFlash {
    staged: Vec<u8>,
    committed: Vec<u8>,
    commits: usize,
}

impl MemoryFlash {
    pub fn erased(len: usize) -> Self {
        Self::from_image(vec![ERASED; len])
    }

    pub fn from_image(image: Vec<u8>) -> Self {
        Self {
            staged: image.clone(),
            committed: image,
            commits: 0,
        }
    }

    /// What survives a power cut right now.
    pub fn committed_image(&self) -> &[u8] {
        &self.committed
    }

    pub fn commit_count(&self) -> usize {
        self.commits
    }
}

impl Default for MemoryFlash {
    fn default() -> Self {
        Self::erased(FLASH_SIZE)
    }
}

impl Flash for MemoryFlash {
    fn len(&self) -> usize {
        self.staged.len()
    }

    fn read(&self, offset: usize, buf: &mut [u8]) {
        buf.copy_from_slice(&self.staged[offset..offset + buf.len()]);
    }

    fn stage(&mut self, offset: usize, data: &[u8]) {
        self.staged[offset..offset + data.len()].copy_from_slice(data);
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.committed.copy_from_slice(&self.staged);
        self.commits += 1;
        Ok(())
    }
}

#[derive(Debug)]
pub struct PersistentStore<F: Flash> {
    flash: F,
}

impl<F: Flash> PersistentStore<F> {
    pub fn new(flash: F) -> Result<Self, StoreError> {
        if flash.len() < layout::END {
            return Err(StoreError::RegionTooSmall {
                len: flash.len(),
                required: layout::END,
            });
        }
        Ok(Self { flash })
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn into_flash(self) -> F {
        self.flash
    }

    pub fn has_device_id(&self) -> bool {
        self.flash.read_byte(layout::DEVICE_ID_PRESENT) == DEVICE_ID_SET
    }

    pub fn device_id(&self) -> u16 {
        let mut bytes = [0_u8; 2];
        self.flash.read(layout::DEVICE_ID, &mut bytes);
        u16::from_le_bytes(bytes)
    }

    pub fn set_device_id(&mut self, id: u16) -> Result<(), StoreError> {
        self.flash.stage(layout::DEVICE_ID, &id.to_le_bytes());
        self.flash.stage(layout::DEVICE_ID_PRESENT, &[DEVICE_ID_SET]);
        self.flash.commit()
    }

    pub fn has_wifi_credentials(&self) -> bool {
        self.flash.read_byte(layout::WIFI_CREDENTIALS_PRESENT) == WIFI_CREDENTIALS_SET
    }

    pub fn ssid(&self) -> String {
        self.read_string(StringRegion::Ssid)
    }

    pub fn password(&self) -> String {
        self.read_string(StringRegion::Password)
    }

    pub fn save_wifi_credentials(&mut self, ssid: &str, password: &str) -> Result<(), StoreError> {
        check_capacity(ssid)?;
        check_capacity(password)?;

        self.flash
            .stage(layout::WIFI_CREDENTIALS_PRESENT, &[WIFI_CREDENTIALS_SET]);
        self.stage_string(ssid, StringRegion::Ssid);
        self.stage_string(password, StringRegion::Password);
        self.flash.commit()
    }

    /// Erased flash yields the default mode; any other byte is returned as stored.
    pub fn mode(&self) -> OperatingMode {
        match self.flash.read_byte(layout::OPERATING_MODE) {
            ERASED => OperatingMode::DEFAULT,
            raw => OperatingMode::from_byte(raw),
        }
    }

    pub fn set_mode(&mut self, mode: OperatingMode) -> Result<(), StoreError> {
        self.flash.stage(layout::OPERATING_MODE, &[mode.as_byte()]);
        self.flash.commit()
    }

    pub fn alias(&self) -> String {
        self.read_string(StringRegion::Alias)
    }

    pub fn set_alias(&mut self, alias: &str) -> Result<(), StoreError> {
        self.write_string(alias, StringRegion::Alias)
    }

    pub fn server_url(&self) -> String {
        self.read_string(StringRegion::ServerUrl)
    }

    pub fn set_server_url(&mut self, url: &str) -> Result<(), StoreError> {
        self.write_string(url, StringRegion::ServerUrl)
    }

    pub fn has_server_url(&self) -> bool {
        self.has_string_at(StringRegion::ServerUrl)
    }

    pub fn wifi_failure_log(&self) -> String {
        self.read_string(StringRegion::FailureLog)
    }

    pub fn wifi_failures(&self) -> Vec<u64> {
        parse_failure_log(&self.wifi_failure_log())
    }

    /// Appends a timestamp, dropping the oldest entries once the region is full.
    pub fn add_wifi_failure(&mut self, timestamp_ms: u64) -> Result<(), StoreError> {
        let mut failures = self.wifi_failures();
        failures.push(timestamp_ms);

        let mut serialized = serialize_failure_log(&failures);
        let mut dropped = 0_usize;
        while serialized.len() > MAX_STRING_LEN && failures.len() > 1 {
            failures.remove(0);
            dropped += 1;
            serialized = serialize_failure_log(&failures);
        }
        if dropped > 0 {
            warn!("wifi failure log full; dropped {dropped} oldest entries");
        }

        info!("recording wifi failure at {timestamp_ms}; log is now {serialized}");
        self.write_string(&serialized, StringRegion::FailureLog)
    }

    pub fn clear_wifi_failure_log(&mut self) -> Result<(), StoreError> {
        info!("clearing wifi failure log");
        self.write_string("", StringRegion::FailureLog)
    }

    /// Factory reset. The device id survives.
    pub fn clear_all(&mut self) -> Result<(), StoreError> {
        warn!("clearing stored configuration");
        for region in StringRegion::ALL {
            self.stage_string("", region);
        }
        self.flash
            .stage(layout::WIFI_CREDENTIALS_PRESENT, &[WIFI_CREDENTIALS_CLEARED]);
        self.flash.commit()
    }

    /// Applies a portal submission in a single commit, or nothing at all.
    pub fn apply_configuration(&mut self, request: &ConfigureRequest) -> Result<(), StoreError> {
        for value in [
            request.ssid.as_str(),
            request.password.as_str(),
            request.alias.as_str(),
            request.server.as_str(),
        ] {
            check_capacity(value)?;
        }

        self.flash
            .stage(layout::WIFI_CREDENTIALS_PRESENT, &[WIFI_CREDENTIALS_SET]);
        self.stage_string(&request.ssid, StringRegion::Ssid);
        self.stage_string(&request.password, StringRegion::Password);
        self.stage_string(&request.alias, StringRegion::Alias);
        self.stage_string(&request.server, StringRegion::ServerUrl);
        self.flash
            .stage(layout::OPERATING_MODE, &[request.operating_mode().as_byte()]);
        self.flash.commit()
    }

    pub fn view(&self) -> StoredConfigView {
        StoredConfigView {
            stored_ssid: self.ssid(),
            alias: self.alias(),
            server: self.server_url(),
            mode: self.mode(),
        }
    }

    pub fn read_string(&self, region: StringRegion) -> String {
        let offset = region.offset();
        let len = self.flash.read_byte(offset);
        if len == ERASED {
            debug!("{region:?} is uninitialized");
            return String::new();
        }

        let mut payload = vec![0_u8; len as usize];
        self.flash.read(offset + 1, &mut payload);
        String::from_utf8_lossy(&payload).into_owned()
    }

    pub fn write_string(&mut self, value: &str, region: StringRegion) -> Result<(), StoreError> {
        check_capacity(value)?;
        debug!("writing {} byte string to {region:?}", value.len());
        self.stage_string(value, region);
        self.flash.commit()
    }

    pub fn has_string_at(&self, region: StringRegion) -> bool {
        let len = self.flash.read_byte(region.offset());
        len != ERASED && len > 0
    }

    fn stage_string(&mut self, value: &str, region: StringRegion) {
        let mut bytes = Vec::with_capacity(value.len() + 1);
        bytes.push(value.len() as u8);
        bytes.extend_from_slice(value.as_bytes());
        self.flash.stage(region.offset(), &bytes);
    }
}

fn check_capacity(value: &str) -> Result<(), StoreError> {
    if value.len() > MAX_STRING_LEN {
        return Err(StoreError::Capacity {
            len: value.len(),
            max: MAX_STRING_LEN,
        });
    }
    Ok(())
}

fn parse_failure_log(raw: &str) -> Vec<u64> {
    if raw.is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<Vec<u64>>(raw) {
        Ok(failures) => failures,
        Err(err) => {
            warn!("discarding unreadable wifi failure log `{raw}`: {err}");
            Vec::new()
        }
    }
}

fn serialize_failure_log(failures: &[u64]) -> String {
    let entries: Vec<String> = failures.iter().map(u64::to_string).collect();
    format!("[{}]", entries.join(","))
}
