//! Snapshot of the process environment, taken once at startup.
//!
//! Rules and definitions never read `std::env` themselves; they receive a
//! [`BuildEnvironment`] so that every lookup sees the same values and a
//! missing variable is reported before any entry is touched.
//!
//! Strings in a definition may reference variables as `${env.NAME}`.

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

use crate::{ConfigError, ConfigResult};

static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{env\.([A-Za-z_][A-Za-z0-9_]*)\}").expect("static regex is valid")
});

#[derive(Debug, Clone, Default)]
pub struct BuildEnvironment {
    vars: HashMap<String, String>,
}

impl BuildEnvironment {
    /// Capture the current process environment. Non-UTF-8 variables are skipped.
    pub fn capture() -> Self {
        Self {
            vars: std::env::vars_os()
                .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
                .collect(),
        }
    }

    /// Build a snapshot from explicit pairs.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: vars
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(|s| s.as_str())
    }

    /// Look up a variable that must be present.
    pub fn require(&self, name: &str) -> ConfigResult<&str> {
        self.get(name)
            .ok_or_else(|| ConfigError::MissingEnv(name.to_string()))
    }

    /// Comma separated list, trimmed, empty items dropped.
    pub fn list(&self, name: &str) -> Vec<String> {
        self.get(name)
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Optional unsigned integer.
    pub fn usize(&self, name: &str) -> ConfigResult<Option<usize>> {
        match self.get(name) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::InvalidValue {
                    field: name.to_string(),
                    message: format!("expected a non-negative integer, got '{}'", raw),
                }),
        }
    }

    /// Replace every `${env.NAME}` in `input`.
    ///
    /// Fails on the first variable that is not set.
    pub fn interpolate(&self, input: &str) -> ConfigResult<String> {
        if let Some(missing) = VAR_REGEX
            .captures_iter(input)
            .map(|caps| caps[1].to_string())
            .find(|name| self.get(name).is_none())
        {
            return Err(ConfigError::MissingEnv(missing));
        }

        Ok(VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                self.get(&caps[1]).unwrap_or_default().to_string()
            })
            .to_string())
    }
}
