//! Build entries: one concrete configuration of the matrix.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::reference::PackageReference;

/// Value of a package option.
///
/// Conan reads option values the Python way, so booleans render as
/// `True`/`False`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Bool(true) => f.write_str("True"),
            OptionValue::Bool(false) => f.write_str("False"),
            OptionValue::Int(i) => write!(f, "{}", i),
            OptionValue::Str(s) => f.write_str(s),
        }
    }
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        OptionValue::Bool(value)
    }
}

impl From<i64> for OptionValue {
    fn from(value: i64) -> Self {
        OptionValue::Int(value)
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        OptionValue::Str(value.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(value: String) -> Self {
        OptionValue::Str(value)
    }
}

/// One candidate build configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildEntry {
    /// Conan settings (`compiler.libcxx`, `arch`, ...).
    pub settings: BTreeMap<String, String>,
    /// Package options, keyed as `package:option` or bare `option`.
    pub options: BTreeMap<String, OptionValue>,
    /// Environment variables passed to the build (`-e`).
    pub env_vars: BTreeMap<String, String>,
    /// Reference override for this entry only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<PackageReference>,
}

impl BuildEntry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<OptionValue>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    pub fn setting(&self, key: &str) -> Option<&str> {
        self.settings.get(key).map(|s| s.as_str())
    }

    pub fn option(&self, key: &str) -> Option<&OptionValue> {
        self.options.get(key)
    }

    /// Merge `options` into this entry, overwriting keys that already exist.
    pub fn merge_options(&mut self, options: &BTreeMap<String, OptionValue>) {
        for (key, value) in options {
            self.options.insert(key.clone(), value.clone());
        }
    }

    /// Short human-readable description, e.g. `gcc 9 x86_64 Release cppstd=14 libcxx=libstdc++11`.
    pub fn label(&self) -> String {
        let mut parts = Vec::new();

        match (self.setting("compiler"), self.setting("compiler.version")) {
            (Some(compiler), Some(version)) => parts.push(format!("{} {}", compiler, version)),
            (Some(compiler), None) => parts.push(compiler.to_string()),
            _ => {}
        }
        for key in ["arch", "build_type"] {
            if let Some(value) = self.setting(key) {
                parts.push(value.to_string());
            }
        }

        const SHOWN: [&str; 5] = ["compiler", "compiler.version", "arch", "build_type", "os"];
        for (key, value) in &self.settings {
            if SHOWN.contains(&key.as_str()) {
                continue;
            }
            let key = key.strip_prefix("compiler.").unwrap_or(key);
            parts.push(format!("{}={}", key, value));
        }

        if !self.options.is_empty() {
            let opts: Vec<String> = self
                .options
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            parts.push(format!("[{}]", opts.join(" ")));
        }

        parts.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_option_value_renders_python_bools() {
        assert_eq!(OptionValue::Bool(true).to_string(), "True");
        assert_eq!(OptionValue::Bool(false).to_string(), "False");
        assert_eq!(OptionValue::Int(3).to_string(), "3");
        assert_eq!(OptionValue::from("static").to_string(), "static");
    }

    #[test]
    fn test_merge_overwrites_only_given_keys() {
        let mut entry = BuildEntry::new()
            .with_option("CHM:with_mpi", false)
            .with_option("CHM:shared", true);

        let mut update = BTreeMap::new();
        update.insert("CHM:with_mpi".to_string(), OptionValue::Bool(true));
        update.insert("boost:without_mpi".to_string(), OptionValue::Bool(false));
        entry.merge_options(&update);

        assert_eq!(entry.option("CHM:with_mpi"), Some(&OptionValue::Bool(true)));
        assert_eq!(entry.option("CHM:shared"), Some(&OptionValue::Bool(true)));
        assert_eq!(
            entry.option("boost:without_mpi"),
            Some(&OptionValue::Bool(false))
        );
        assert_eq!(entry.options.len(), 3);
    }

    #[test]
    fn test_label() {
        let entry = BuildEntry::new()
            .with_setting("os", "Linux")
            .with_setting("compiler", "gcc")
            .with_setting("compiler.version", "9")
            .with_setting("compiler.libcxx", "libstdc++11")
            .with_setting("compiler.cppstd", "14")
            .with_setting("arch", "x86_64")
            .with_setting("build_type", "Release")
            .with_option("CHM:with_mpi", true);

        assert_eq!(
            entry.label(),
            "gcc 9 x86_64 Release cppstd=14 libcxx=libstdc++11 [CHM:with_mpi=True]"
        );
    }

    #[test]
    fn test_option_value_deserializes_untagged() {
        let v: OptionValue = serde_json::from_str("true").unwrap();
        assert_eq!(v, OptionValue::Bool(true));
        let v: OptionValue = serde_json::from_str("\"shared\"").unwrap();
        assert_eq!(v, OptionValue::Str("shared".to_string()));
    }
}
