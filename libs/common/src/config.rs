//! Layered configuration loading
//!
//! Priority (highest to lowest):
//! 1. Environment variables (`{PREFIX}_` prefixed)
//! 2. Configuration file (format chosen by extension)
//! 3. Default values of the configuration type

use crate::{Error, Result};
use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Load configuration from defaults, an optional file and the environment
///
/// # Arguments
/// * `prefix` - Environment variable prefix without the trailing underscore (e.g. `PLCWIRE`)
/// * `path` - Optional configuration file (`.toml`, `.yaml`/`.yml` or `.json`)
pub fn load_config<T>(prefix: &str, path: Option<&Path>) -> Result<T>
where
    T: Serialize + for<'de> Deserialize<'de> + Default,
{
    let mut figment = Figment::from(Serialized::defaults(T::default()));

    if let Some(path) = path {
        figment = merge_file(figment, path)?;
    }

    let env_prefix = format!("{}_", prefix.to_uppercase());
    debug!("Loading configuration (env prefix: {})", env_prefix);

    Ok(figment.merge(Env::prefixed(&env_prefix)).extract()?)
}

/// Load configuration from a specific file only
pub fn load_config_from_file<T, P>(path: P) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    // figment skips missing files silently; a file-only load must not
    std::fs::metadata(path)?;
    Ok(merge_file(Figment::new(), path)?.extract()?)
}

fn merge_file(figment: Figment, path: &Path) -> Result<Figment> {
    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::Config("Config file must have an extension".to_string()))?;

    match extension {
        "toml" => Ok(figment.merge(Toml::file(path))),
        "yaml" | "yml" => Ok(figment.merge(Yaml::file(path))),
        "json" => Ok(figment.merge(Json::file(path))),
        _ => Err(Error::Config(format!(
            "Unsupported config file format: {}",
            extension
        ))),
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use std::io::Write;

    #[derive(Debug, Default, Deserialize, Serialize, PartialEq)]
    struct TestConfig {
        name: String,
        port: u16,
        passive: bool,
    }

    #[test]
    fn test_defaults_without_file() {
        let config: TestConfig = load_config("PLCWIRE_TEST_DEFAULTS", None).unwrap();
        assert_eq!(config, TestConfig::default());
    }

    #[test]
    fn test_yaml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conversation.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "name: ads\nport: 48898").unwrap();

        let config: TestConfig = load_config("PLCWIRE_TEST_YAML", Some(&path)).unwrap();
        assert_eq!(config.name, "ads");
        assert_eq!(config.port, 48898);
        assert!(!config.passive);
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conversation.ini");
        std::fs::write(&path, "name=x").unwrap();

        let result: Result<TestConfig> = load_config_from_file(&path);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");

        let result: Result<TestConfig> = load_config_from_file(&path);
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conversation.toml");
        std::fs::write(&path, "port = \"not a number\"\n").unwrap();

        let result: Result<TestConfig> = load_config_from_file(&path);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_toml_file_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conversation.toml");
        std::fs::write(&path, "name = \"s7\"\nport = 102\npassive = true\n").unwrap();

        let config: TestConfig = load_config_from_file(&path).unwrap();
        assert_eq!(
            config,
            TestConfig {
                name: "s7".to_string(),
                port: 102,
                passive: true,
            }
        );
    }
}
