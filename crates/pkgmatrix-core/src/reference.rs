//! Conan package references (`name/version@user/channel`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageReference {
    pub name: String,
    pub version: String,
    pub user: Option<String>,
    pub channel: Option<String>,
}

impl PackageReference {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            user: None,
            channel: None,
        }
    }

    pub fn with_user_channel(mut self, user: impl Into<String>, channel: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.channel = Some(channel.into());
        self
    }

    /// `user/channel`, if both are set.
    pub fn user_channel(&self) -> Option<String> {
        match (&self.user, &self.channel) {
            (Some(user), Some(channel)) => Some(format!("{}/{}", user, channel)),
            _ => None,
        }
    }
}

impl fmt::Display for PackageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)?;
        if let Some(uc) = self.user_channel() {
            write!(f, "@{}", uc)?;
        }
        Ok(())
    }
}

fn valid_component(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '+'))
}

impl FromStr for PackageReference {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = || Error::InvalidInput(format!("invalid package reference: '{}'", s));

        let (name_version, user_channel) = match s.split_once('@') {
            Some((nv, uc)) => (nv, Some(uc)),
            None => (s, None),
        };

        let (name, version) = name_version.split_once('/').ok_or_else(invalid)?;
        if !valid_component(name) || !valid_component(version) {
            return Err(invalid());
        }

        let mut reference = PackageReference::new(name, version);
        if let Some(uc) = user_channel {
            let (user, channel) = uc.split_once('/').ok_or_else(invalid)?;
            if !valid_component(user) || !valid_component(channel) {
                return Err(invalid());
            }
            reference = reference.with_user_channel(user, channel);
        }

        Ok(reference)
    }
}
