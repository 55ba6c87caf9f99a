use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use config::{Config, Environment, File, FileFormat};
use eyre::{Context, Result, eyre};

use crate::{
    config::{models::Configuration, settings::Settings},
    core::merge::merge_configurations,
};

/// Serialization format of a dynamic configuration file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Toml,
    Json,
}

impl ConfigFormat {
    /// Detect the format from the file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Some(Self::Yaml),
            Some("toml") => Some(Self::Toml),
            Some("json") => Some(Self::Json),
            _ => None,
        }
    }
}

/// Load static settings using the config crate.
///
/// Values from the file can be overridden with `PORTWAY__SECTION__KEY` environment variables.
pub fn load_settings(path: impl AsRef<Path>) -> Result<Settings> {
    let path = path.as_ref();

    let format = match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        _ => FileFormat::Yaml,
    };

    let settings = Config::builder()
        .add_source(File::new(
            path.to_str()
                .ok_or_else(|| eyre!("Invalid UTF-8 path: {}", path.display()))?,
            format,
        ))
        .add_source(Environment::with_prefix("PORTWAY").separator("__"))
        .build()
        .with_context(|| format!("Failed to build settings from {}", path.display()))?;

    settings
        .try_deserialize()
        .with_context(|| format!("Failed to deserialize settings from {}", path.display()))
}

/// Decode a dynamic configuration document.
pub fn decode_configuration(contents: &str, format: ConfigFormat) -> Result<Configuration> {
    let config = match format {
        ConfigFormat::Yaml => serde_yaml::from_str(contents).wrap_err("Invalid YAML document")?,
        ConfigFormat::Toml => toml::from_str(contents).wrap_err("Invalid TOML document")?,
        ConfigFormat::Json => serde_json::from_str(contents).wrap_err("Invalid JSON document")?,
    };
    Ok(config)
}

/// Encode a dynamic configuration document.
pub fn encode_configuration(config: &Configuration, format: ConfigFormat) -> Result<String> {
    let encoded = match format {
        ConfigFormat::Yaml => serde_yaml::to_string(config).wrap_err("Failed to encode YAML")?,
        ConfigFormat::Toml => toml::to_string_pretty(config).wrap_err("Failed to encode TOML")?,
        ConfigFormat::Json => {
            serde_json::to_string_pretty(config).wrap_err("Failed to encode JSON")?
        }
    };
    Ok(encoded)
}

/// Read one dynamic configuration file.
pub fn load_configuration_file(path: &Path) -> Result<Configuration> {
    let format = ConfigFormat::from_path(path)
        .ok_or_else(|| eyre!("Unsupported configuration file type: {}", path.display()))?;
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read configuration file {}", path.display()))?;
    decode_configuration(&contents, format)
        .with_context(|| format!("Failed to decode configuration file {}", path.display()))
}

/// Supported configuration files directly inside `dir`, sorted by name.
pub fn configuration_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to read configuration directory {}", dir.display()))?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && ConfigFormat::from_path(&path).is_some() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Read every supported file of a directory and merge them into one snapshot.
pub fn load_configuration_dir(dir: &Path) -> Result<Configuration> {
    let mut per_file = BTreeMap::new();
    for path in configuration_files(dir)? {
        let config = load_configuration_file(&path)?;
        let key = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        per_file.insert(key, Arc::new(config));
    }
    Ok(merge_configurations(&per_file))
}

/// Load a dynamic configuration from a file or a directory.
pub fn load_configuration(path: &Path) -> Result<Configuration> {
    if path.is_dir() {
        load_configuration_dir(path)
    } else {
        load_configuration_file(path)
    }
}
