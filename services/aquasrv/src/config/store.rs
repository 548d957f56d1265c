//! Flash page persistence for the device configuration

use std::fmt;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{info, warn};

use super::device::{Config, ConfigError, FLASH_PAGE};

/// Storage of the single configuration page
pub trait ConfigStore: Send + Sync {
    fn read_page(&self) -> Result<[u8; FLASH_PAGE], ConfigError>;
    fn write_page(&self, page: &[u8; FLASH_PAGE]) -> Result<(), ConfigError>;
}

/// Result of reading the page at boot
#[derive(Debug, Clone, PartialEq)]
pub enum FlashStatus {
    Ok,
    Failed(ConfigError),
}

impl fmt::Display for FlashStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashStatus::Ok => f.write_str("OK"),
            FlashStatus::Failed(e) => write!(f, "{}", e),
        }
    }
}

/// Page kept in a file; a missing file reads as erased flash
#[derive(Debug)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for FileConfigStore {
    fn read_page(&self) -> Result<[u8; FLASH_PAGE], ConfigError> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok([0xFF; FLASH_PAGE]),
            Err(e) => return Err(ConfigError::Read(e.to_string())),
        };
        let mut page = [0xFF; FLASH_PAGE];
        let len = data.len().min(FLASH_PAGE);
        page[..len].copy_from_slice(&data[..len]);
        Ok(page)
    }

    fn write_page(&self, page: &[u8; FLASH_PAGE]) -> Result<(), ConfigError> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).map_err(|e| ConfigError::Write(e.to_string()))?;
            }
        }
        std::fs::write(&self.path, page).map_err(|e| ConfigError::Write(e.to_string()))
    }
}

/// Page held in memory, starts erased
#[derive(Debug)]
pub struct MemConfigStore {
    page: Mutex<[u8; FLASH_PAGE]>,
}

impl Default for MemConfigStore {
    fn default() -> Self {
        Self {
            page: Mutex::new([0xFF; FLASH_PAGE]),
        }
    }
}

impl MemConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigStore for MemConfigStore {
    fn read_page(&self) -> Result<[u8; FLASH_PAGE], ConfigError> {
        Ok(*self.page.lock())
    }

    fn write_page(&self, page: &[u8; FLASH_PAGE]) -> Result<(), ConfigError> {
        *self.page.lock() = *page;
        Ok(())
    }
}

/// Load the configuration, falling back to defaults when the page is unusable
pub fn load_device_config(store: &dyn ConfigStore) -> (Config, FlashStatus) {
    match store.read_page().and_then(|page| Config::decode(&page)) {
        Ok(config) => {
            info!("Device configuration loaded from flash");
            (config, FlashStatus::Ok)
        },
        Err(e) => {
            warn!("Flash configuration unusable ({}), using defaults", e);
            (Config::default(), FlashStatus::Failed(e))
        },
    }
}

pub fn save_device_config(store: &dyn ConfigStore, config: &Config) -> Result<(), ConfigError> {
    store.write_page(&config.encode())?;
    info!("Device configuration saved");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::device::state::Meter;

    #[test]
    fn test_blank_store_gives_defaults() {
        let store = MemConfigStore::new();
        let (config, status) = load_device_config(&store);
        assert_eq!(config, Config::default());
        assert_eq!(status, FlashStatus::Failed(ConfigError::Empty));
        assert_eq!(status.to_string(), "No data");
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConfigStore::new(dir.path().join("cfg").join("flash.bin"));
        let mut config = Config::default();
        config.set_increment(Meter::Filter, 1).unwrap();
        save_device_config(&store, &config).unwrap();

        let (loaded, status) = load_device_config(&store);
        assert_eq!(status, FlashStatus::Ok);
        assert_eq!(loaded.increment(Meter::Filter), 1);
    }

    #[test]
    fn test_corrupt_file_reports_crc() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flash.bin");
        let mut page = Config::default().encode();
        page[0] ^= 0xFF;
        std::fs::write(&path, page).unwrap();

        let (config, status) = load_device_config(&FileConfigStore::new(&path));
        assert_eq!(config, Config::default());
        assert_eq!(status.to_string(), "CRC error");
    }
}
