// Environment variable loading

use crate::{ConfigError, Result};
use std::collections::HashMap;
use std::env;
use std::str::FromStr;

/// Environment variable loader
pub struct EnvLoader {
    prefix: Option<String>,
}

impl EnvLoader {
    /// Create a new environment loader
    pub fn new(prefix: Option<String>) -> Self {
        Self { prefix }
    }

    /// Create a loader that only keeps variables starting with `prefix`
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self::new(Some(prefix.into()))
    }

    /// Load a `.env` file into the process environment before reading it.
    ///
    /// A missing file is not an error; a malformed one is.
    pub fn load_dotenv(&self, path: Option<&str>) -> Result<()> {
        let outcome = match path {
            Some(path) => dotenvy::from_path(path),
            None => dotenvy::dotenv().map(|_| ()),
        };

        match outcome {
            Ok(()) => Ok(()),
            Err(e) if e.not_found() => Ok(()),
            Err(e) => Err(ConfigError::LoadError(e.to_string())),
        }
    }

    /// Load all matching environment variables
    pub fn load(&self) -> Result<Vars> {
        Ok(self.filter(env::vars()))
    }

    /// Apply prefix filtering to an arbitrary set of key/value pairs
    pub fn filter<I>(&self, vars: I) -> Vars
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut config = HashMap::new();

        for (key, value) in vars {
            if let Some(ref prefix) = self.prefix {
                if key.starts_with(prefix.as_str()) {
                    let trimmed_key =
                        key.trim_start_matches(prefix.as_str()).trim_start_matches('_');
                    config.insert(trimmed_key.to_lowercase(), value);
                }
            } else {
                config.insert(key.to_lowercase(), value);
            }
        }

        Vars::from(config)
    }

    /// Load a specific environment variable
    pub fn load_var(&self, key: &str) -> Result<String> {
        let full_key = if let Some(ref prefix) = self.prefix {
            format!("{}_{}", prefix, key.to_uppercase())
        } else {
            key.to_uppercase()
        };

        env::var(&full_key).map_err(ConfigError::EnvError)
    }

    /// Load with default value
    pub fn load_var_or(&self, key: &str, default: &str) -> String {
        self.load_var(key).unwrap_or_else(|_| default.to_string())
    }
}

impl Default for EnvLoader {
    fn default() -> Self {
        Self::new(None)
    }
}

/// A loaded set of configuration values with typed accessors.
///
/// Keys are lowercase with the loader prefix removed, so `KAFKA_BROKERS`
/// loaded with prefix `KAFKA` is looked up as `brokers`.
#[derive(Debug, Clone, Default)]
pub struct Vars {
    values: HashMap<String, String>,
}

impl Vars {
    /// Raw string value, ignoring blank entries
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(&key.to_lowercase())
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Required string value
    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| ConfigError::KeyNotFound(key.to_string()))
    }

    /// Parse a value with `FromStr`
    pub fn parse<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw
                .parse::<T>()
                .map(Some)
                .map_err(|e| ConfigError::parse(key, e.to_string())),
            None => Ok(None),
        }
    }

    /// Boolean flag: `1`, `true`, `yes`, `on` are true; `0`, `false`, `no`, `off` are false
    pub fn flag(&self, key: &str) -> Result<Option<bool>> {
        match self.get(key) {
            Some(raw) => match raw.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(Some(true)),
                "0" | "false" | "no" | "off" => Ok(Some(false)),
                other => Err(ConfigError::parse(key, format!("not a boolean: {other}"))),
            },
            None => Ok(None),
        }
    }

    /// Comma-separated list, trimmed, without empty items
    pub fn list(&self, key: &str) -> Option<Vec<String>> {
        self.get(key).map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl From<HashMap<String, String>> for Vars {
    fn from(values: HashMap<String, String>) -> Self {
        let values = values
            .into_iter()
            .map(|(k, v)| (k.to_lowercase(), v))
            .collect();
        Self { values }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Vars {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let values: HashMap<String, String> = iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self::from(values)
    }
}
