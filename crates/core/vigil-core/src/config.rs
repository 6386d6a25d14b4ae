//! Configuration loading for the Vigil crates.
//!
//! A [`ConfigLoader`] stacks layers in the order they are added: later layers
//! override earlier ones key by key. Typical usage layers a TOML file under
//! `VIGIL_`-prefixed environment variables, then deserialises one section
//! per component:
//!
//! ```rust
//! use serde::Deserialize;
//! use vigil_core::{ConfigFormat, ConfigLoader};
//!
//! #[derive(Debug, Default, Deserialize)]
//! #[serde(default)]
//! struct Limits {
//!     max_pending: u32,
//! }
//!
//! let limits: Limits = ConfigLoader::new()
//!     .with_str("[limits]\nmax_pending = 8", ConfigFormat::Toml)
//!     .load_section("limits")
//!     .unwrap();
//! assert_eq!(limits.max_pending, 8);
//! ```

use crate::{VigilError, VigilResult};
use config::{Config, Environment, File, FileFormat};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable prefix used by [`ConfigLoader::with_default_env`]
pub const ENV_PREFIX: &str = "VIGIL";

/// Supported configuration file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// TOML format
    Toml,
    /// JSON format
    Json,
}

impl ConfigFormat {
    /// Detect the format from a file extension
    pub fn from_path(path: &Path) -> VigilResult<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Ok(Self::Toml),
            Some("json") => Ok(Self::Json),
            _ => Err(VigilError::config(format!(
                "Cannot detect config format of {}",
                path.display()
            ))),
        }
    }

    fn file_format(self) -> FileFormat {
        match self {
            Self::Toml => FileFormat::Toml,
            Self::Json => FileFormat::Json,
        }
    }
}

#[derive(Debug, Clone)]
enum Layer {
    File {
        path: PathBuf,
        format: ConfigFormat,
        required: bool,
    },
    Inline {
        content: String,
        format: ConfigFormat,
    },
    Env {
        prefix: String,
    },
}

/// Layered configuration loader
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    layers: Vec<Layer>,
}

impl ConfigLoader {
    /// Create a loader with no layers; loading yields defaults only
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file layer that must exist
    pub fn with_file<P: AsRef<Path>>(self, path: P) -> VigilResult<Self> {
        self.push_file(path.as_ref(), true)
    }

    /// Add a file layer that is skipped when the file is absent
    pub fn with_optional_file<P: AsRef<Path>>(self, path: P) -> VigilResult<Self> {
        self.push_file(path.as_ref(), false)
    }

    fn push_file(mut self, path: &Path, required: bool) -> VigilResult<Self> {
        let format = ConfigFormat::from_path(path)?;
        self.layers.push(Layer::File {
            path: path.to_path_buf(),
            format,
            required,
        });
        Ok(self)
    }

    /// Add an in-memory document layer
    #[must_use]
    pub fn with_str(mut self, content: &str, format: ConfigFormat) -> Self {
        self.layers.push(Layer::Inline {
            content: content.to_string(),
            format,
        });
        self
    }

    /// Add an environment layer: `<PREFIX>_SECTION__KEY=value` maps to `section.key`
    #[must_use]
    pub fn with_env<S: Into<String>>(mut self, prefix: S) -> Self {
        self.layers.push(Layer::Env {
            prefix: prefix.into(),
        });
        self
    }

    /// Add the environment layer with the standard `VIGIL` prefix
    #[must_use]
    pub fn with_default_env(self) -> Self {
        self.with_env(ENV_PREFIX)
    }

    fn build(&self) -> VigilResult<Config> {
        debug!(layers = self.layers.len(), "Building configuration");
        let mut builder = Config::builder();
        for layer in &self.layers {
            builder = match layer {
                Layer::File {
                    path,
                    format,
                    required,
                } => builder.add_source(
                    File::from(path.as_path())
                        .format(format.file_format())
                        .required(*required),
                ),
                Layer::Inline { content, format } => {
                    builder.add_source(File::from_str(content, format.file_format()))
                }
                Layer::Env { prefix } => builder.add_source(
                    Environment::with_prefix(prefix)
                        .prefix_separator("_")
                        .separator("__")
                        .try_parsing(true),
                ),
            };
        }
        Ok(builder.build()?)
    }

    /// Deserialize the whole merged document
    pub fn load<T: DeserializeOwned>(&self) -> VigilResult<T> {
        Ok(self.build()?.try_deserialize()?)
    }

    /// Deserialize one top-level section, falling back to `T::default()` when it is absent
    pub fn load_section<T: DeserializeOwned + Default>(&self, section: &str) -> VigilResult<T> {
        match self.build()?.get::<T>(section) {
            Ok(value) => Ok(value),
            Err(config::ConfigError::NotFound(_)) => {
                debug!(section, "Configuration section absent, using defaults");
                Ok(T::default())
            }
            Err(err) => Err(VigilError::config(format!(
                "Invalid [{section}] section: {err}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    #[serde(default)]
    struct Sample {
        name: String,
        retries: u32,
        strict: bool,
    }

    impl Default for Sample {
        fn default() -> Self {
            Self {
                name: "default".to_string(),
                retries: 3,
                strict: false,
            }
        }
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(
            ConfigFormat::from_path(Path::new("a/b.toml")).unwrap(),
            ConfigFormat::Toml
        );
        assert_eq!(
            ConfigFormat::from_path(Path::new("b.json")).unwrap(),
            ConfigFormat::Json
        );
        assert!(ConfigFormat::from_path(Path::new("b.ini")).is_err());
    }

    #[test]
    fn test_missing_section_uses_default() {
        let sample: Sample = ConfigLoader::new().load_section("sample").unwrap();
        assert_eq!(sample, Sample::default());
    }

    #[test]
    fn test_later_layers_override() {
        let sample: Sample = ConfigLoader::new()
            .with_str("[sample]\nname = \"first\"\nretries = 1", ConfigFormat::Toml)
            .with_str(r#"{"sample": {"retries": 7}}"#, ConfigFormat::Json)
            .load_section("sample")
            .unwrap();
        assert_eq!(sample.name, "first");
        assert_eq!(sample.retries, 7);
        assert!(!sample.strict);
    }

    #[test]
    fn test_wrong_type_is_configuration_error() {
        let err = ConfigLoader::new()
            .with_str("[sample]\nretries = \"many\"", ConfigFormat::Toml)
            .load_section::<Sample>("sample")
            .unwrap_err();
        assert!(matches!(err, VigilError::Configuration(_)));
    }

    #[test]
    fn test_optional_file_may_be_absent() {
        let sample: Sample = ConfigLoader::new()
            .with_optional_file("/nonexistent/vigil.toml")
            .unwrap()
            .load_section("sample")
            .unwrap();
        assert_eq!(sample, Sample::default());
    }
}
