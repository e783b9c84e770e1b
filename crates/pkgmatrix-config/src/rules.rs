//! Filter and update rules read from a matrix definition.
//!
//! A rule's condition is resolved against the [`BuildEnvironment`] before the
//! rule touches the matrix. Environment conditions do not look at the entry
//! at all, so they apply to every entry or to none.

use pkgmatrix_core::predicate::Constant;
use pkgmatrix_core::{
    BuildEntry, BuildMatrix, BuildPredicate, BuildUpdate, OptionEquals, OptionValue,
    SettingEquals,
};
use serde::Serialize;
use tracing::{debug, info};

use crate::{BuildEnvironment, ConfigResult};

/// When a rule applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    Always,
    /// Environment variable equals a value. The variable must be set.
    EnvEquals { var: String, value: String },
    SettingEquals { key: String, value: String },
    OptionEquals { key: String, value: OptionValue },
}

/// A condition with its environment lookups already done.
#[derive(Debug, Clone)]
pub enum ResolvedCondition {
    Constant(Constant),
    Setting(SettingEquals),
    Option(OptionEquals),
}

impl BuildPredicate for ResolvedCondition {
    fn matches(&self, entry: &BuildEntry) -> bool {
        match self {
            ResolvedCondition::Constant(c) => c.matches(entry),
            ResolvedCondition::Setting(s) => s.matches(entry),
            ResolvedCondition::Option(o) => o.matches(entry),
        }
    }
}

impl Condition {
    pub fn env_equals(var: impl Into<String>, value: impl Into<String>) -> Self {
        Condition::EnvEquals {
            var: var.into(),
            value: value.into(),
        }
    }

    pub fn setting_equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Condition::SettingEquals {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Turn this condition into an entry predicate.
    ///
    /// Fails with [`ConfigError::MissingEnv`](crate::ConfigError::MissingEnv)
    /// when an environment condition names an unset variable.
    pub fn resolve(&self, env: &BuildEnvironment) -> ConfigResult<ResolvedCondition> {
        Ok(match self {
            Condition::Always => ResolvedCondition::Constant(Constant(true)),
            Condition::EnvEquals { var, value } => {
                let actual = env.require(var)?;
                ResolvedCondition::Constant(Constant(actual == value.as_str()))
            }
            Condition::SettingEquals { key, value } => {
                ResolvedCondition::Setting(SettingEquals::new(key.clone(), value.clone()))
            }
            Condition::OptionEquals { key, value } => {
                ResolvedCondition::Option(OptionEquals::new(key.clone(), value.clone()))
            }
        })
    }
}

/// Drop entries matching a condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoveRule {
    pub condition: Condition,
}

impl RemoveRule {
    pub fn new(condition: Condition) -> Self {
        Self { condition }
    }

    /// Returns the number of entries removed.
    pub fn apply(&self, matrix: &mut BuildMatrix, env: &BuildEnvironment) -> ConfigResult<usize> {
        let predicate = self.condition.resolve(env)?;
        let removed = matrix.remove_build_if(predicate);
        info!(condition = ?self.condition, removed, remaining = matrix.len(), "Applied remove rule");
        Ok(removed)
    }
}

/// Merge options (and optionally settings/env vars) into matching entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateRule {
    pub condition: Condition,
    pub update: BuildUpdate,
}

impl UpdateRule {
    pub fn new(condition: Condition, update: BuildUpdate) -> Self {
        Self { condition, update }
    }

    /// Returns the number of entries updated. On error nothing is modified.
    pub fn apply(&self, matrix: &mut BuildMatrix, env: &BuildEnvironment) -> ConfigResult<usize> {
        let predicate = self.condition.resolve(env)?;
        debug!(condition = ?self.condition, resolved = ?predicate, "Resolved update condition");
        let updated = matrix.update_build_if_with(predicate, &self.update);
        info!(condition = ?self.condition, updated, "Applied update rule");
        Ok(updated)
    }
}
