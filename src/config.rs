// config.rs

use std::net;

#[cfg(target_os = "espidf")]
use anyhow::anyhow;
#[cfg(target_os = "espidf")]
use crc::{Crc, CRC_32_ISCSI};
#[cfg(target_os = "espidf")]
use esp_idf_svc::nvs;
#[cfg(target_os = "espidf")]
use log::*;
use serde::{Deserialize, Serialize};

pub const NVS_BUF_SIZE: usize = 512;

const DEFAULT_API_PORT: u16 = 80;
const DEFAULT_WIFI_RETRIES: u32 = 5;
const DEFAULT_NTP_SERVER: &str = "pool.ntp.org";
const DEFAULT_HTML_DIR: &str = "/spiffs/html";
const DEFAULT_SCHEDULE_PATH: &str = "/spiffs/times.dat";

#[cfg(target_os = "espidf")]
const CONFIG_NAME: &str = "cfg";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MyConfig {
    pub listen: net::Ipv4Addr,
    pub port: u16,

    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub wifi_retries: u32,

    pub v4dhcp: bool,
    pub v4addr: net::Ipv4Addr,
    pub v4mask: u8,
    pub v4gw: net::Ipv4Addr,

    pub ntp_server: String,
    pub html_dir: String,
    pub schedule_path: String,
}

impl Default for MyConfig {
    fn default() -> Self {
        Self {
            listen: net::Ipv4Addr::UNSPECIFIED,
            port: option_env!("API_PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_API_PORT),

            wifi_ssid: option_env!("WIFI_SSID").unwrap_or_default().into(),
            wifi_pass: option_env!("WIFI_PASS").unwrap_or_default().into(),
            wifi_retries: DEFAULT_WIFI_RETRIES,

            v4dhcp: true,
            v4addr: net::Ipv4Addr::UNSPECIFIED,
            v4mask: 0,
            v4gw: net::Ipv4Addr::UNSPECIFIED,

            ntp_server: DEFAULT_NTP_SERVER.into(),
            html_dir: DEFAULT_HTML_DIR.into(),
            schedule_path: DEFAULT_SCHEDULE_PATH.into(),
        }
    }
}

impl MyConfig {
    /// Defaults overridden by `API_PORT`, `HTML_DIR`, `SCHEDULE_PATH` and `NTP_SERVER`
    /// from the process environment.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(port) = var("API_PORT").and_then(|p| p.parse().ok()) {
            self.port = port;
        }
        if let Some(dir) = var("HTML_DIR") {
            self.html_dir = dir;
        }
        if let Some(path) = var("SCHEDULE_PATH") {
            self.schedule_path = path;
        }
        if let Some(server) = var("NTP_SERVER") {
            self.ntp_server = server;
        }
        self
    }
}

/// Persistent copy of [`MyConfig`] in one NVS namespace: a postcard blob
/// with a CRC-32 trailer under the key `cfg`.
#[cfg(target_os = "espidf")]
pub struct ConfigStore {
    nvs: nvs::EspNvs<nvs::NvsDefault>,
}

#[cfg(target_os = "espidf")]
static BLOB_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

#[cfg(target_os = "espidf")]
impl ConfigStore {
    pub fn new(nvs: nvs::EspNvs<nvs::NvsDefault>) -> Self {
        Self { nvs }
    }

    /// Stored config, or None when missing or corrupt.
    pub fn load(&mut self) -> Option<MyConfig> {
        let mut buf = [0u8; NVS_BUF_SIZE];
        let blob = match self.nvs.get_raw(CONFIG_NAME, &mut buf) {
            Ok(Some(blob)) => blob,
            Ok(None) => {
                warn!("No stored config");
                return None;
            }
            Err(e) => {
                error!("NVS read failed: {e:?}");
                return None;
            }
        };

        postcard::from_bytes_crc32::<MyConfig>(blob, BLOB_CRC.digest())
            .inspect(|_| info!("Loaded config, {} bytes", blob.len()))
            .inspect_err(|e| error!("Stored config rejected: {e:?}"))
            .ok()
    }

    pub fn save(&mut self, config: &MyConfig) -> anyhow::Result<()> {
        let mut buf = [0u8; NVS_BUF_SIZE];
        let blob = postcard::to_slice_crc32(config, &mut buf, BLOB_CRC.digest())
            .map_err(|e| anyhow!("config encode failed: {e:?}"))?;
        self.nvs
            .set_raw(CONFIG_NAME, blob)
            .map_err(|e| anyhow!("NVS write failed: {e:?}"))?;
        info!("Saved config, {} bytes", blob.len());
        Ok(())
    }

    /// Stored config, replaced by the defaults when unusable.
    pub fn load_or_init(&mut self) -> anyhow::Result<MyConfig> {
        match self.load() {
            Some(config) => Ok(config),
            None => self.reset(),
        }
    }

    /// Overwrite the stored config with the defaults.
    pub fn reset(&mut self) -> anyhow::Result<MyConfig> {
        let config = MyConfig::default();
        self.save(&config)?;
        Ok(config)
    }
}


// EOF
