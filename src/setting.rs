//! 设备配置与 WiFi 凭据的持久化
//!
//! `SettingStore` 在内存中保存当前配置，启动时从 [`Storage`] 载入，
//! 每次修改立即写回。值以 JSON 编码，底层可以是 NVS、文件或内存。

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const CONFIG_KEY: &str = "config";
const CREDS_KEY: &str = "creds";

/// 持久化错误
#[derive(Debug)]
pub enum StoreError {
    /// 底层存储读写失败
    Backend(String),
    /// JSON 编解码失败
    Encoding(serde_json::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Backend(msg) => write!(f, "storage backend error: {}", msg),
            StoreError::Encoding(e) => write!(f, "encoding error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Encoding(e)
    }
}

/// 键值存储后端
pub trait Storage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError>;
    fn remove(&mut self, key: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemStorage {
    entries: HashMap<String, Vec<u8>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }
}

/// 每个键一个文件，用于主机上调试
#[derive(Debug)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| StoreError::Backend(format!("create {}: {}", dir.display(), e)))?;
        Ok(Self { dir })
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match std::fs::read(self.path(key)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Backend(format!("read {}: {}", key, e))),
        }
    }

    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        std::fs::write(self.path(key), value)
            .map_err(|e| StoreError::Backend(format!("write {}: {}", key, e)))
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        match std::fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Backend(format!("remove {}: {}", key, e))),
        }
    }
}

/// 通过网页设置的设备参数
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub lat: f64,
    pub lon: f64,
    /// 天气预报取第几个时间段
    pub foreindex: u8,
    /// 天气服务的 API key
    pub ap_id: String,
    pub min_level: u8,
    pub min_lum: u16,
    pub max_level: u8,
    pub max_lum: u16,
    /// 自定义点亮的像素 `[row, col]`
    pub custom_pos: Vec<[u8; 2]>,
    /// 配网页面无操作超时（秒）
    pub timeout: u32,
    pub debug: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            lat: 46.98457,
            lon: 8.30702,
            foreindex: 4,
            ap_id: String::new(),
            min_level: 15,
            min_lum: 15,
            max_level: 15,
            max_lum: 100,
            custom_pos: vec![[1, 3], [4, 8], [1, 2]],
            timeout: 300,
            debug: false,
        }
    }
}

impl fmt::Debug for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConfig")
            .field("lat", &self.lat)
            .field("lon", &self.lon)
            .field("foreindex", &self.foreindex)
            .field("ap_id", &"*".repeat(self.ap_id.len()))
            .field("min_level", &self.min_level)
            .field("min_lum", &self.min_lum)
            .field("max_level", &self.max_level)
            .field("max_lum", &self.max_lum)
            .field("custom_pos", &self.custom_pos)
            .field("timeout", &self.timeout)
            .field("debug", &self.debug)
            .finish()
    }
}

impl DeviceConfig {
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.timeout.max(1)))
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub ssid: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("ssid", &self.ssid)
            .field("password", &"*".repeat(self.password.len()))
            .finish()
    }
}

impl Credentials {
    pub fn new(ssid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            ssid: ssid.into(),
            password: password.into(),
        }
    }

    /// 802.11 的 SSID 最长 32 字节，口令最长 64 字节
    pub fn is_valid(&self) -> bool {
        !self.ssid.is_empty() && self.ssid.len() <= 32 && self.password.len() <= 64
    }
}

/// 内存中的配置 + 持久化后端
pub struct SettingStore {
    config: DeviceConfig,
    credentials: Option<Credentials>,
    storage: Box<dyn Storage>,
}

impl SettingStore {
    /// 启动时载入；读不出来或格式不对时使用默认值
    pub fn load(storage: Box<dyn Storage>) -> Self {
        let config = match read_json::<DeviceConfig>(storage.as_ref(), CONFIG_KEY) {
            Ok(Some(config)) => config,
            Ok(None) => DeviceConfig::default(),
            Err(e) => {
                log::error!("Failed to load config, using defaults: {}", e);
                DeviceConfig::default()
            }
        };

        let credentials = read_json::<Credentials>(storage.as_ref(), CREDS_KEY)
            .map_err(|e| log::error!("Failed to load credentials: {}", e))
            .ok()
            .flatten();

        log::info!("Loaded config: {:?}", config);
        log::info!("Loaded credentials: {:?}", credentials);

        Self {
            config,
            credentials,
            storage,
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: DeviceConfig) -> Result<(), StoreError> {
        let data = serde_json::to_vec(&config)?;
        self.storage.set(CONFIG_KEY, &data)?;
        self.config = config;
        Ok(())
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn set_credentials(&mut self, credentials: Credentials) -> Result<(), StoreError> {
        let data = serde_json::to_vec(&credentials)?;
        self.storage.set(CREDS_KEY, &data)?;
        self.credentials = Some(credentials);
        Ok(())
    }

    pub fn remove_credentials(&mut self) -> Result<(), StoreError> {
        self.credentials = None;
        self.storage.remove(CREDS_KEY)
    }

    pub fn into_storage(self) -> Box<dyn Storage> {
        self.storage
    }
}

fn read_json<T: serde::de::DeserializeOwned>(
    storage: &dyn Storage,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match storage.get(key)? {
        Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
        None => Ok(None),
    }
}
