//! Configuration
//!
//! - **`device`** - controller parameters stored in the flash page
//! - **`store`** - flash page backends
//! - **`service`** - host-side service settings (figment layered)

pub mod device;
pub mod service;
pub mod store;

pub use device::{parse_hex_value, Config, ConfigError};
pub use service::{CanBackend, ServiceConfig};
pub use store::{
    load_device_config, save_device_config, ConfigStore, FileConfigStore, FlashStatus,
    MemConfigStore,
};
