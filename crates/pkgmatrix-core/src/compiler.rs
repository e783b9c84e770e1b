//! Compiler families and the profiles that drive matrix population.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::Error;

/// A compiler family, named as Conan's `compiler` setting names it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
pub enum CompilerFamily {
    #[display("gcc")]
    Gcc,
    #[display("clang")]
    Clang,
    #[display("apple-clang")]
    AppleClang,
}

impl CompilerFamily {
    /// Standard library ABIs built for this family at `version`.
    ///
    /// gcc older than 5 only ships the old `libstdc++` ABI.
    pub fn libcxx_variants(&self, version: &str) -> Vec<&'static str> {
        match self {
            CompilerFamily::Gcc => {
                if major_version(version).is_some_and(|major| major < 5) {
                    vec!["libstdc++"]
                } else {
                    vec!["libstdc++", "libstdc++11"]
                }
            }
            CompilerFamily::Clang => vec!["libstdc++", "libc++"],
            CompilerFamily::AppleClang => vec!["libc++"],
        }
    }

    /// `os` setting used when the matrix does not name one.
    pub fn default_os(&self) -> &'static str {
        match self {
            CompilerFamily::Gcc | CompilerFamily::Clang => "Linux",
            CompilerFamily::AppleClang => "Macos",
        }
    }

    /// Name of the `CONAN_*_VERSIONS` environment variable for this family.
    pub fn versions_env_var(&self) -> &'static str {
        match self {
            CompilerFamily::Gcc => "CONAN_GCC_VERSIONS",
            CompilerFamily::Clang => "CONAN_CLANG_VERSIONS",
            CompilerFamily::AppleClang => "CONAN_APPLE_CLANG_VERSIONS",
        }
    }

    pub fn all() -> [CompilerFamily; 3] {
        [
            CompilerFamily::Gcc,
            CompilerFamily::Clang,
            CompilerFamily::AppleClang,
        ]
    }
}

impl FromStr for CompilerFamily {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "gcc" => Ok(CompilerFamily::Gcc),
            "clang" => Ok(CompilerFamily::Clang),
            "apple-clang" | "apple_clang" => Ok(CompilerFamily::AppleClang),
            other => Err(Error::InvalidInput(format!(
                "unknown compiler family: {}",
                other
            ))),
        }
    }
}

fn major_version(version: &str) -> Option<u32> {
    version.split('.').next().and_then(|m| m.parse().ok())
}

/// A compiler family with the versions to build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilerProfile {
    pub family: CompilerFamily,
    pub versions: Vec<String>,
}

impl CompilerProfile {
    pub fn new<I, S>(family: CompilerFamily, versions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            family,
            versions: versions.into_iter().map(Into::into).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gcc_abi_variants() {
        assert_eq!(
            CompilerFamily::Gcc.libcxx_variants("9"),
            vec!["libstdc++", "libstdc++11"]
        );
        assert_eq!(CompilerFamily::Gcc.libcxx_variants("4.9"), vec!["libstdc++"]);
    }

    #[test]
    fn test_family_roundtrip() {
        for family in CompilerFamily::all() {
            let parsed: CompilerFamily = family.to_string().parse().unwrap();
            assert_eq!(parsed, family);
        }
        assert!("msvc".parse::<CompilerFamily>().is_err());
    }
}
