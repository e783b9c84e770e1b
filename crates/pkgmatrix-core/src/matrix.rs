//! The build matrix: dimensions, generated entries, and the rules that prune
//! and adjust them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::compiler::CompilerProfile;
use crate::entry::{BuildEntry, OptionValue};
use crate::predicate::BuildPredicate;
use crate::{Error, Result};

/// Changes applied to every entry an update rule matches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildUpdate {
    pub options: BTreeMap<String, OptionValue>,
    pub settings: BTreeMap<String, String>,
    pub env_vars: BTreeMap<String, String>,
}

impl BuildUpdate {
    pub fn options(options: BTreeMap<String, OptionValue>) -> Self {
        Self {
            options,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty() && self.settings.is_empty() && self.env_vars.is_empty()
    }

    fn apply(&self, entry: &mut BuildEntry) {
        entry.merge_options(&self.options);
        for (key, value) in &self.settings {
            entry.settings.insert(key.clone(), value.clone());
        }
        for (key, value) in &self.env_vars {
            entry.env_vars.insert(key.clone(), value.clone());
        }
    }
}

/// Cross-product of build dimensions plus the entries generated from it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildMatrix {
    pub cppstds: Vec<String>,
    pub archs: Vec<String>,
    pub build_types: Vec<String>,
    pub compilers: Vec<CompilerProfile>,
    /// Overrides the compiler family's default `os` setting.
    pub os: Option<String>,
    entries: Vec<BuildEntry>,
}

impl BuildMatrix {
    /// Create an empty matrix scoped to the given dimensions.
    pub fn new<I, J, K, S>(cppstds: I, archs: J, build_types: K) -> Self
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = S>,
        K: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cppstds: cppstds.into_iter().map(Into::into).collect(),
            archs: archs.into_iter().map(Into::into).collect(),
            build_types: build_types.into_iter().map(Into::into).collect(),
            compilers: Vec::new(),
            os: None,
            entries: Vec::new(),
        }
    }

    pub fn with_compilers(mut self, compilers: Vec<CompilerProfile>) -> Self {
        self.compilers = compilers;
        self
    }

    pub fn with_os(mut self, os: impl Into<String>) -> Self {
        self.os = Some(os.into());
        self
    }

    pub fn entries(&self) -> &[BuildEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<BuildEntry> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append an explicit entry.
    pub fn add(&mut self, entry: BuildEntry) {
        self.entries.push(entry);
    }

    /// Populate the matrix with the cross-product of every dimension.
    ///
    /// Nesting order is compiler, version, arch, build type, cppstd, libcxx,
    /// shared. With `pure_c` no `compiler.cppstd`/`compiler.libcxx` settings
    /// are generated. With a `shared_option_name` each combination is emitted
    /// twice, once per value of that option. Returns the number of entries added.
    pub fn add_common_builds(&mut self, pure_c: bool, shared_option_name: Option<&str>) -> usize {
        let before = self.entries.len();

        let cppstds: Vec<Option<&str>> = if pure_c {
            vec![None]
        } else {
            self.cppstds.iter().map(|s| Some(s.as_str())).collect()
        };
        let shared_values: Vec<Option<bool>> = match shared_option_name {
            Some(_) => vec![Some(true), Some(false)],
            None => vec![None],
        };

        let mut generated = Vec::new();
        for profile in &self.compilers {
            let os = self
                .os
                .clone()
                .unwrap_or_else(|| profile.family.default_os().to_string());

            for version in &profile.versions {
                let libcxxs: Vec<Option<&str>> = if pure_c {
                    vec![None]
                } else {
                    profile
                        .family
                        .libcxx_variants(version)
                        .into_iter()
                        .map(Some)
                        .collect()
                };

                for arch in &self.archs {
                    for build_type in &self.build_types {
                        for cppstd in &cppstds {
                            for libcxx in &libcxxs {
                                for shared in &shared_values {
                                    let mut entry = BuildEntry::new()
                                        .with_setting("os", os.clone())
                                        .with_setting("compiler", profile.family.to_string())
                                        .with_setting("compiler.version", version.clone())
                                        .with_setting("arch", arch.clone())
                                        .with_setting("build_type", build_type.clone());
                                    if let Some(cppstd) = cppstd {
                                        entry = entry.with_setting("compiler.cppstd", *cppstd);
                                    }
                                    if let Some(libcxx) = libcxx {
                                        entry = entry.with_setting("compiler.libcxx", *libcxx);
                                    }
                                    if let (Some(name), Some(shared)) = (shared_option_name, shared)
                                    {
                                        entry = entry.with_option(name, *shared);
                                    }
                                    generated.push(entry);
                                }
                            }
                        }
                    }
                }
            }
        }

        self.entries.extend(generated);
        let added = self.entries.len() - before;
        debug!(added, pure_c, ?shared_option_name, "Populated common builds");
        added
    }

    /// Remove every entry the predicate matches. Order of the rest is kept.
    /// Returns the number of entries removed.
    pub fn remove_build_if<P: BuildPredicate>(&mut self, predicate: P) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| !predicate.matches(entry));
        let removed = before - self.entries.len();
        debug!(removed, remaining = self.entries.len(), "Removed builds");
        removed
    }

    /// Merge `new_options` into every entry the predicate matches, overwriting
    /// keys of the same name. Returns the number of entries updated.
    pub fn update_build_if<P: BuildPredicate>(
        &mut self,
        predicate: P,
        new_options: &BTreeMap<String, OptionValue>,
    ) -> usize {
        self.update_build_if_with(predicate, &BuildUpdate::options(new_options.clone()))
    }

    /// Like [`update_build_if`](Self::update_build_if), but can also change
    /// settings and environment variables.
    pub fn update_build_if_with<P: BuildPredicate>(
        &mut self,
        predicate: P,
        update: &BuildUpdate,
    ) -> usize {
        let mut updated = 0;
        for entry in self.entries.iter_mut() {
            if predicate.matches(entry) {
                update.apply(entry);
                updated += 1;
            }
        }
        debug!(updated, "Updated builds");
        updated
    }

    /// Keep only the entries belonging to page `current` of `total`.
    ///
    /// Entries are dealt round-robin: entry `i` belongs to page
    /// `i % total + 1`. `current` is 1-based.
    pub fn page(&mut self, current: usize, total: usize) -> Result<()> {
        if total == 0 || current == 0 || current > total {
            return Err(Error::InvalidInput(format!(
                "invalid page {} of {}",
                current, total
            )));
        }

        let entries = std::mem::take(&mut self.entries);
        self.entries = entries
            .into_iter()
            .enumerate()
            .filter(|(i, _)| i % total == current - 1)
            .map(|(_, entry)| entry)
            .collect();
        debug!(current, total, kept = self.entries.len(), "Selected page");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::CompilerFamily;
    use crate::predicate::SettingEquals;

    fn mpi_options() -> BTreeMap<String, OptionValue> {
        let mut opts = BTreeMap::new();
        opts.insert("CHM:with_mpi".to_string(), OptionValue::Bool(true));
        opts.insert("boost:without_mpi".to_string(), OptionValue::Bool(false));
        opts.insert("trilinos:with_mpi".to_string(), OptionValue::Bool(true));
        opts
    }

    fn reference_matrix() -> BuildMatrix {
        let mut matrix = BuildMatrix::new(["14"], ["x86_64"], ["Release"]).with_compilers(vec![
            CompilerProfile::new(CompilerFamily::Gcc, ["7", "9"]),
            CompilerProfile::new(CompilerFamily::Clang, ["10"]),
        ]);
        matrix.add_common_builds(false, None);
        matrix
    }

    #[test]
    fn test_populate_cross_product() {
        let matrix = reference_matrix();
        // gcc 7, gcc 9: 2 ABIs each; clang 10: 2 standard libraries
        assert_eq!(matrix.len(), 6);
        for entry in matrix.entries() {
            assert_eq!(entry.setting("arch"), Some("x86_64"));
            assert_eq!(entry.setting("build_type"), Some("Release"));
            assert_eq!(entry.setting("compiler.cppstd"), Some("14"));
            assert_eq!(entry.setting("os"), Some("Linux"));
            assert!(entry.options.is_empty());
        }
    }

    #[test]
    fn test_populate_pure_c_and_shared() {
        let mut matrix = BuildMatrix::new(["14", "17"], ["x86_64", "armv8"], ["Release"])
            .with_compilers(vec![CompilerProfile::new(CompilerFamily::Gcc, ["9"])]);
        let added = matrix.add_common_builds(true, Some("CHM:shared"));

        // cppstd and libcxx collapse; shared doubles
        assert_eq!(added, 4);
        for entry in matrix.entries() {
            assert!(entry.setting("compiler.libcxx").is_none());
            assert!(entry.setting("compiler.cppstd").is_none());
            assert!(entry.option("CHM:shared").is_some());
        }
    }

    #[test]
    fn test_empty_dimension_yields_no_entries() {
        let no_cppstds: Vec<&str> = Vec::new();
        let mut matrix = BuildMatrix::new(no_cppstds, vec!["x86_64"], vec!["Release"])
            .with_compilers(vec![CompilerProfile::new(CompilerFamily::Gcc, ["9"])]);
        assert_eq!(matrix.add_common_builds(false, None), 0);
        assert!(matrix.is_empty());
    }

    #[test]
    fn test_remove_legacy_abi() {
        let mut matrix = reference_matrix();
        let before: Vec<BuildEntry> = matrix.entries().to_vec();

        let removed = matrix.remove_build_if(SettingEquals::new("compiler.libcxx", "libstdc++"));
        assert_eq!(removed, 3);
        assert!(
            matrix
                .entries()
                .iter()
                .all(|e| e.setting("compiler.libcxx") != Some("libstdc++"))
        );

        // Survivors keep their relative order
        let expected: Vec<BuildEntry> = before
            .into_iter()
            .filter(|e| e.setting("compiler.libcxx") != Some("libstdc++"))
            .collect();
        assert_eq!(matrix.entries(), expected.as_slice());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut matrix = reference_matrix();
        let old_abi = SettingEquals::new("compiler.libcxx", "libstdc++");
        matrix.remove_build_if(old_abi.clone());
        let after_first = matrix.entries().to_vec();
        assert_eq!(matrix.remove_build_if(old_abi), 0);
        assert_eq!(matrix.entries(), after_first.as_slice());
    }

    #[test]
    fn test_update_when_condition_holds() {
        let mut matrix = reference_matrix();
        matrix.remove_build_if(SettingEquals::new("compiler.libcxx", "libstdc++"));
        matrix.add(
            BuildEntry::new()
                .with_setting("compiler", "gcc")
                .with_option("CHM:with_mpi", false)
                .with_option("CHM:shared", true),
        );
        let before = matrix.entries().to_vec();

        let use_mpi = "with-mpi";
        let updated = matrix.update_build_if(|_: &BuildEntry| use_mpi == "with-mpi", &mpi_options());
        assert_eq!(updated, matrix.len());

        for (old, new) in before.iter().zip(matrix.entries()) {
            assert_eq!(old.settings, new.settings);
            assert_eq!(old.env_vars, new.env_vars);
            for (key, value) in mpi_options() {
                assert_eq!(new.option(&key), Some(&value));
            }
            for (key, value) in &old.options {
                if !mpi_options().contains_key(key) {
                    assert_eq!(new.option(key), Some(value));
                }
            }
        }
    }

    #[test]
    fn test_update_when_condition_fails_touches_nothing() {
        let mut matrix = reference_matrix();
        let before = matrix.entries().to_vec();
        let use_mpi = "without-mpi";
        let updated = matrix.update_build_if(|_: &BuildEntry| use_mpi == "with-mpi", &mpi_options());
        assert_eq!(updated, 0);
        assert_eq!(matrix.entries(), before.as_slice());
    }

    #[test]
    fn test_update_with_settings_and_env() {
        let mut matrix = reference_matrix();
        let mut update = BuildUpdate::default();
        update.env_vars.insert("CC".to_string(), "clang".to_string());
        let updated =
            matrix.update_build_if_with(SettingEquals::new("compiler", "clang"), &update);
        assert_eq!(updated, 2);
        assert_eq!(
            matrix
                .entries()
                .iter()
                .filter(|e| e.env_vars.contains_key("CC"))
                .count(),
            2
        );
    }

    #[test]
    fn test_pages_partition_entries() {
        let full = reference_matrix();
        let mut seen = Vec::new();
        for current in 1..=4 {
            let mut page = full.clone();
            page.page(current, 4).unwrap();
            seen.extend(page.into_entries());
        }
        assert_eq!(seen.len(), full.len());
        for entry in full.entries() {
            assert_eq!(seen.iter().filter(|e| *e == entry).count(), 1);
        }
    }

    #[test]
    fn test_invalid_page() {
        let mut matrix = reference_matrix();
        assert!(matrix.page(0, 2).is_err());
        assert!(matrix.page(3, 2).is_err());
        assert!(matrix.page(1, 0).is_err());
    }
}
