//! Layered configuration loading
//!
//! Priority (lowest to highest): struct defaults, YAML file, environment.

use std::path::Path;

use errors::AquaResult;
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

/// Build the layered figment for a service
///
/// Environment keys use `{prefix}` and `__` as the nesting separator,
/// e.g. `AQUASRV_STORAGE__FRAM_PATH`.
pub fn figment_for<T>(file: Option<&Path>, env_prefix: &str) -> Figment
where
    T: Serialize + Default,
{
    let mut figment = Figment::from(Serialized::defaults(T::default()));
    if let Some(path) = file {
        if path.exists() {
            info!("Loading configuration from {}", path.display());
            figment = figment.merge(Yaml::file(path));
        } else {
            debug!("Configuration file {} not found, using defaults", path.display());
        }
    }
    figment.merge(Env::prefixed(env_prefix).split("__"))
}

/// Load and deserialize a service configuration
pub fn load_config<T>(file: Option<&Path>, env_prefix: &str) -> AquaResult<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    figment_for::<T>(file, env_prefix)
        .extract()
        .map_err(|e| errors::config_error!("Failed to load configuration: {}", e))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use errors::AquaError;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        name: String,
        port: u16,
    }

    impl Default for Sample {
        fn default() -> Self {
            Self {
                name: "dev".to_string(),
                port: 1,
            }
        }
    }

    #[test]
    fn test_defaults_when_file_missing() {
        let cfg: Sample =
            load_config(Some(Path::new("/nonexistent/sample.yaml")), "SAMPLE_TEST_A_").unwrap();
        assert_eq!(cfg, Sample::default());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.yaml");
        std::fs::write(&path, "port: 502\n").unwrap();

        let cfg: Sample = load_config(Some(&path), "SAMPLE_TEST_B_").unwrap();
        assert_eq!(cfg.port, 502);
        assert_eq!(cfg.name, "dev");
    }

    #[test]
    fn test_bad_value_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.yaml");
        std::fs::write(&path, "port: many\n").unwrap();

        let err = load_config::<Sample>(Some(&path), "SAMPLE_TEST_C_").unwrap_err();
        assert!(matches!(err, AquaError::Configuration(_)));
    }
}
