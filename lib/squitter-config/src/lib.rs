//! Layered configuration loading.
#![deny(warnings)]
#![deny(missing_docs)]

use std::{borrow::Cow, path::Path};

use figment::{
    error::Kind,
    providers::{Env, Serialized},
    Figment, Provider,
};
use serde::Deserialize;
use snafu::{ResultExt as _, Snafu};
use tracing::debug;

mod provider;
use self::provider::ResolvedProvider;

/// Separator used in environment variable names to address nested fields.
///
/// For example, with a prefix of `app`, `APP_SINK__PATH` sets the `path` field of the `sink` table.
pub const ENV_NESTING_SEPARATOR: &str = "__";

/// A configuration error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ConfigurationError {
    /// Environment variable prefix was empty.
    #[snafu(display("Environment variable prefix must not be empty."))]
    EmptyPrefix,

    /// A configuration file could not be loaded.
    #[snafu(display("Failed to load configuration file '{}': {}", path, source))]
    File {
        /// Path to the file.
        path: String,

        /// Error source.
        source: figment::Error,
    },

    /// Requested field was missing from the configuration.
    #[snafu(display("Missing field '{}' in configuration. {}", field, help_text))]
    MissingField {
        /// Help text describing how to set the missing field.
        help_text: String,

        /// Name of the missing field.
        field: Cow<'static, str>,
    },

    /// Requested field's data type was not the expected data type.
    #[snafu(display(
        "Expected value for field '{}' to be '{}', got '{}' instead.",
        field,
        expected_ty,
        actual_ty
    ))]
    InvalidFieldType {
        /// Name of the invalid field.
        ///
        /// This is a period-separated path to the field.
        field: String,

        /// Expected data type.
        expected_ty: String,

        /// Actual data type.
        actual_ty: String,
    },

    /// Generic configuration error.
    #[snafu(display("Failed to load configuration: {}", source))]
    Generic {
        /// Error source.
        source: figment::Error,
    },
}

struct BoxedProvider(Box<dyn Provider + Send + Sync>);

impl Provider for BoxedProvider {
    fn metadata(&self) -> figment::Metadata {
        self.0.metadata()
    }

    fn data(&self) -> Result<figment::value::Map<figment::Profile, figment::value::Dict>, figment::Error> {
        self.0.data()
    }
}

/// A configuration loader that can pull from various sources.
///
/// Sources are layered in the order they are added: sources added later take precedence over sources added earlier.
/// Once all sources are added, the merged configuration is extracted as a typed value with
/// [`into_typed`][Self::into_typed].
///
/// # Supported sources
///
/// - YAML file
/// - JSON file
/// - environment variables (must be prefixed; see [`from_environment`][Self::from_environment])
#[derive(Default)]
pub struct ConfigurationLoader {
    env_prefixes: Vec<String>,
    providers: Vec<BoxedProvider>,
}

impl ConfigurationLoader {
    /// Loads the given YAML configuration file.
    ///
    /// # Errors
    ///
    /// If the file could not be read, or if the file is not valid YAML, an error will be returned.
    pub fn from_yaml<P>(mut self, path: P) -> Result<Self, ConfigurationError>
    where
        P: AsRef<Path>,
    {
        let provider = ResolvedProvider::from_yaml(&path).context(File {
            path: path.as_ref().display().to_string(),
        })?;
        self.providers.push(BoxedProvider(Box::new(provider)));
        Ok(self)
    }

    /// Loads the given JSON configuration file.
    ///
    /// # Errors
    ///
    /// If the file could not be read, or if the file is not valid JSON, an error will be returned.
    pub fn from_json<P>(mut self, path: P) -> Result<Self, ConfigurationError>
    where
        P: AsRef<Path>,
    {
        let provider = ResolvedProvider::from_json(&path).context(File {
            path: path.as_ref().display().to_string(),
        })?;
        self.providers.push(BoxedProvider(Box::new(provider)));
        Ok(self)
    }

    /// Loads the given configuration file, choosing the format by extension.
    ///
    /// Files ending in `.json` are read as JSON, and everything else as YAML.
    ///
    /// # Errors
    ///
    /// If the file could not be read, or is not valid for its format, an error will be returned.
    pub fn from_file<P>(self, path: P) -> Result<Self, ConfigurationError>
    where
        P: AsRef<Path>,
    {
        let is_json = path
            .as_ref()
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        debug!(path = %path.as_ref().display(), is_json, "Loading configuration file.");
        if is_json {
            self.from_json(path)
        } else {
            self.from_yaml(path)
        }
    }

    /// Loads configuration from environment variables.
    ///
    /// The prefix given will have an underscore appended to it if it does not already end with one. For example, with a
    /// prefix of `app`, any environment variable starting with `app_` would be matched. Nested fields are addressed
    /// with [`ENV_NESTING_SEPARATOR`].
    ///
    /// The prefix is case-insensitive.
    ///
    /// # Errors
    ///
    /// If the prefix is empty, or the matching environment variables cannot be read, an error will be returned.
    pub fn from_environment(mut self, prefix: &str) -> Result<Self, ConfigurationError> {
        if prefix.is_empty() {
            return Err(ConfigurationError::EmptyPrefix);
        }

        let prefix = if prefix.ends_with('_') {
            prefix.to_string()
        } else {
            format!("{}_", prefix)
        };

        // `Env` is not `Send + Sync`, so capture its current values instead of holding onto the provider.
        let values = Env::prefixed(&prefix).split(ENV_NESTING_SEPARATOR).data().context(Generic)?;
        if let Some(default_dict) = values.get(&figment::Profile::Default) {
            debug!(%prefix, keys = default_dict.len(), "Loaded configuration from environment.");
            self.providers
                .push(BoxedProvider(Box::new(Serialized::defaults(default_dict.clone()))));
            self.env_prefixes.push(prefix.to_uppercase());
        }
        Ok(self)
    }

    /// Consumes the configuration loader, deserializing it as `T`.
    ///
    /// ## Errors
    ///
    /// If the configuration could not be deserialized into `T`, an error will be returned.
    pub fn into_typed<'a, T>(self) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        let figment = self
            .providers
            .into_iter()
            .fold(Figment::new(), |figment, provider| figment.admerge(provider));

        figment.extract().map_err(|e| from_figment_error(&self.env_prefixes, e))
    }
}

fn from_figment_error(env_prefixes: &[String], e: figment::Error) -> ConfigurationError {
    match e.kind {
        Kind::MissingField(field) => {
            let mut path = e.path.clone();
            path.push(field.to_string());

            let mut valid_keys = vec![path.join(".")];
            valid_keys.extend(
                env_prefixes
                    .iter()
                    .map(|prefix| format!("{}{}", prefix, path.join(ENV_NESTING_SEPARATOR).to_uppercase())),
            );
            let help_text = format!("Try setting `{}`.", valid_keys.join("` or `"));

            ConfigurationError::MissingField { help_text, field }
        }
        Kind::InvalidType(actual_ty, expected_ty) => ConfigurationError::InvalidFieldType {
            field: e.path.join("."),
            expected_ty,
            actual_ty: actual_ty.to_string(),
        },
        _ => ConfigurationError::Generic { source: e },
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Nested {
        path: Option<String>,
        #[serde(default)]
        size: u32,
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Settings {
        name: String,
        #[serde(default)]
        count: u64,
        nested: Nested,
    }

    fn write_file(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn yaml_file() {
        let file = write_file(".yaml", "name: feed\ncount: 3\nnested:\n  path: /tmp/out\n");
        let settings: Settings = ConfigurationLoader::default()
            .from_yaml(file.path())
            .unwrap()
            .into_typed()
            .unwrap();

        assert_eq!(
            settings,
            Settings {
                name: "feed".to_string(),
                count: 3,
                nested: Nested {
                    path: Some("/tmp/out".to_string()),
                    size: 0,
                },
            }
        );
    }

    #[test]
    fn json_file_by_extension() {
        let file = write_file(".json", r#"{"name": "feed", "nested": {"size": 9}}"#);
        let settings: Settings = ConfigurationLoader::default()
            .from_file(file.path())
            .unwrap()
            .into_typed()
            .unwrap();

        assert_eq!(settings.nested.size, 9);
        assert_eq!(settings.count, 0);
    }

    #[test]
    fn later_sources_take_precedence() {
        let yaml = write_file(".yaml", "name: from-yaml\ncount: 1\nnested:\n  size: 1\n");
        let json = write_file(".json", r#"{"count": 2}"#);

        std::env::set_var("SQUITTER_CFG_TEST_PRECEDENCE_COUNT", "3");
        std::env::set_var("SQUITTER_CFG_TEST_PRECEDENCE_NESTED__SIZE", "4");

        let settings: Settings = ConfigurationLoader::default()
            .from_yaml(yaml.path())
            .unwrap()
            .from_json(json.path())
            .unwrap()
            .from_environment("SQUITTER_CFG_TEST_PRECEDENCE")
            .unwrap()
            .into_typed()
            .unwrap();

        assert_eq!(settings.name, "from-yaml");
        assert_eq!(settings.count, 3);
        assert_eq!(settings.nested.size, 4);
    }

    #[test]
    fn missing_field_help_mentions_environment() {
        std::env::set_var("SQUITTER_CFG_TEST_MISSING_COUNT", "1");

        let result = ConfigurationLoader::default()
            .from_environment("squitter_cfg_test_missing")
            .unwrap()
            .into_typed::<Settings>();

        match result {
            Err(ConfigurationError::MissingField { field, help_text }) => {
                assert_eq!(field, "name");
                assert!(help_text.contains("SQUITTER_CFG_TEST_MISSING_"), "help text: {}", help_text);
            }
            other => panic!("expected missing field error, got {:?}", other),
        }
    }

    #[test]
    fn invalid_field_type() {
        let file = write_file(".yaml", "name: feed\ncount: lots\nnested: {}\n");
        let result = ConfigurationLoader::default()
            .from_yaml(file.path())
            .unwrap()
            .into_typed::<Settings>();

        match result {
            Err(ConfigurationError::InvalidFieldType { field, .. }) => assert_eq!(field, "count"),
            other => panic!("expected invalid field type error, got {:?}", other),
        }
    }

    #[test]
    fn missing_files() {
        let dir = tempfile::tempdir().unwrap();

        let missing = dir.path().join("absent.yaml");
        match ConfigurationLoader::default().from_file(&missing) {
            Err(ConfigurationError::File { path, .. }) => assert!(path.ends_with("absent.yaml")),
            Err(e) => panic!("expected file error, got {:?}", e),
            Ok(_) => panic!("expected file error"),
        }

        let missing = dir.path().join("absent.json");
        assert!(matches!(
            ConfigurationLoader::default().from_file(&missing),
            Err(ConfigurationError::File { .. })
        ));
    }

    #[test]
    fn empty_prefix_is_rejected() {
        assert!(matches!(
            ConfigurationLoader::default().from_environment(""),
            Err(ConfigurationError::EmptyPrefix)
        ));
    }
}
