//! Matrix definition parsing.
//!
//! ```kdl
//! package "CHM/${env.CHM_VERSION}@chm/stable"
//!
//! matrix {
//!     cppstds 14
//!     archs "x86_64"
//!     build-types "Release"
//!     compiler "gcc" "9"
//! }
//!
//! common-builds pure-c=#false
//!
//! remove-if setting="compiler.libcxx" equals="libstdc++"
//!
//! update-if env="USE_MPI" equals="with-mpi" {
//!     option "CHM:with_mpi" #true
//! }
//! ```

use crate::rules::{Condition, RemoveRule, UpdateRule};
use crate::{BuildEnvironment, ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode, KdlValue};
use pkgmatrix_core::{
    BuildEntry, BuildMatrix, BuildUpdate, CompilerFamily, CompilerProfile, OptionValue,
    PackageReference,
};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// File looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "pkgmatrix.kdl";

/// Compiler built when neither the definition nor the environment names one.
const FALLBACK_COMPILER: (CompilerFamily, &str) = (CompilerFamily::Gcc, "9");

/// Everything needed to build and run a matrix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatrixDefinition {
    /// Package reference, may contain `${env.NAME}`.
    pub reference: Option<String>,
    pub recipe_dir: String,
    pub cppstds: Vec<String>,
    pub archs: Vec<String>,
    pub build_types: Vec<String>,
    pub compilers: Vec<CompilerProfile>,
    pub os: Option<String>,
    pub pure_c: bool,
    pub shared_option_name: Option<String>,
    /// Entries added explicitly, after the common builds.
    pub builds: Vec<BuildEntry>,
    pub remove_rules: Vec<RemoveRule>,
    pub update_rules: Vec<UpdateRule>,
    pub docker_image: Option<String>,
}

impl Default for MatrixDefinition {
    /// C++14, x86_64, Release; legacy libstdc++ ABI dropped; MPI options
    /// turned on when `USE_MPI=with-mpi`.
    fn default() -> Self {
        let mut mpi = BTreeMap::new();
        mpi.insert("CHM:with_mpi".to_string(), OptionValue::Bool(true));
        mpi.insert("boost:without_mpi".to_string(), OptionValue::Bool(false));
        mpi.insert("trilinos:with_mpi".to_string(), OptionValue::Bool(true));

        Self {
            cppstds: vec!["14".to_string()],
            archs: vec!["x86_64".to_string()],
            build_types: vec!["Release".to_string()],
            remove_rules: vec![RemoveRule::new(Condition::setting_equals(
                "compiler.libcxx",
                "libstdc++",
            ))],
            update_rules: vec![UpdateRule::new(
                Condition::env_equals("USE_MPI", "with-mpi"),
                BuildUpdate::options(mpi),
            )],
            ..Self::empty()
        }
    }
}

impl MatrixDefinition {
    fn empty() -> Self {
        Self {
            reference: None,
            recipe_dir: ".".to_string(),
            cppstds: Vec::new(),
            archs: Vec::new(),
            build_types: Vec::new(),
            compilers: Vec::new(),
            os: None,
            pure_c: false,
            shared_option_name: None,
            builds: Vec::new(),
            remove_rules: Vec::new(),
            update_rules: Vec::new(),
            docker_image: None,
        }
    }

    /// Check every rule's environment requirements without building anything.
    pub fn check_environment(&self, env: &BuildEnvironment) -> ConfigResult<()> {
        for rule in &self.remove_rules {
            rule.condition.resolve(env)?;
        }
        for rule in &self.update_rules {
            rule.condition.resolve(env)?;
        }
        Ok(())
    }

    /// Construct, populate, filter and update the matrix.
    ///
    /// Environment requirements are checked first, so a missing variable
    /// fails before any entry exists.
    pub fn build(&self, env: &BuildEnvironment) -> ConfigResult<BuildMatrix> {
        self.check_environment(env)?;

        let cppstds = if self.pure_c {
            self.cppstds.clone()
        } else {
            dimension(&self.cppstds, env, "CONAN_CPPSTDS", "cppstds")?
        };
        let archs = dimension(&self.archs, env, "CONAN_ARCHS", "archs")?;
        let build_types = dimension(&self.build_types, env, "CONAN_BUILD_TYPES", "build-types")?;

        let mut matrix =
            BuildMatrix::new(cppstds, archs, build_types).with_compilers(self.resolve_compilers(env));
        if let Some(os) = &self.os {
            matrix = matrix.with_os(os.clone());
        }

        let populated = matrix.add_common_builds(self.pure_c, self.shared_option_name.as_deref());
        for entry in &self.builds {
            matrix.add(entry.clone());
        }
        info!(
            populated,
            explicit = self.builds.len(),
            "Populated build matrix"
        );

        for rule in &self.remove_rules {
            rule.apply(&mut matrix, env)?;
        }
        for rule in &self.update_rules {
            rule.apply(&mut matrix, env)?;
        }

        if matrix.is_empty() {
            warn!("Build matrix is empty after applying rules");
        }
        Ok(matrix)
    }

    /// Compilers from the definition, else from `CONAN_*_VERSIONS`, else gcc 9.
    pub fn resolve_compilers(&self, env: &BuildEnvironment) -> Vec<CompilerProfile> {
        if !self.compilers.is_empty() {
            return self.compilers.clone();
        }

        let from_env: Vec<CompilerProfile> = CompilerFamily::all()
            .into_iter()
            .filter_map(|family| {
                let versions = env.list(family.versions_env_var());
                (!versions.is_empty()).then(|| CompilerProfile::new(family, versions))
            })
            .collect();
        if !from_env.is_empty() {
            return from_env;
        }

        let (family, version) = FALLBACK_COMPILER;
        vec![CompilerProfile::new(family, [version])]
    }

    /// The package reference, with `${env.NAME}` expanded.
    ///
    /// Falls back to `CONAN_REFERENCE`; `CONAN_USERNAME`/`CONAN_CHANNEL` fill
    /// in a missing user/channel.
    pub fn reference(&self, env: &BuildEnvironment) -> ConfigResult<Option<PackageReference>> {
        let raw = match self
            .reference
            .as_deref()
            .or_else(|| env.get("CONAN_REFERENCE"))
        {
            Some(raw) => env.interpolate(raw)?,
            None => return Ok(None),
        };

        let mut reference: PackageReference = raw.parse()?;
        if reference.user_channel().is_none() {
            if let (Some(user), Some(channel)) = (env.get("CONAN_USERNAME"), env.get("CONAN_CHANNEL"))
            {
                reference = reference.with_user_channel(user, channel);
            }
        }
        Ok(Some(reference))
    }

    /// Docker image to build in, from the definition or `CONAN_DOCKER_IMAGE`.
    pub fn docker_image(&self, env: &BuildEnvironment) -> ConfigResult<Option<String>> {
        match self
            .docker_image
            .as_deref()
            .or_else(|| env.get("CONAN_DOCKER_IMAGE"))
        {
            Some(image) => Ok(Some(env.interpolate(image)?)),
            None => Ok(None),
        }
    }
}

fn dimension(
    values: &[String],
    env: &BuildEnvironment,
    env_var: &str,
    field: &str,
) -> ConfigResult<Vec<String>> {
    if !values.is_empty() {
        return Ok(values.to_vec());
    }
    let from_env = env.list(env_var);
    if from_env.is_empty() {
        return Err(ConfigError::InvalidValue {
            field: format!("matrix.{}", field),
            message: format!("no values given and {} is not set", env_var),
        });
    }
    Ok(from_env)
}

/// Parse a matrix definition from KDL text.
pub fn parse_definition(kdl: &str) -> ConfigResult<MatrixDefinition> {
    let doc: KdlDocument = kdl.parse()?;
    let mut def = MatrixDefinition::empty();
    let mut seen_package = false;

    for node in doc.nodes() {
        match node.name().value() {
            "package" => {
                if seen_package {
                    return Err(ConfigError::Duplicate("package".to_string()));
                }
                seen_package = true;
                def.reference = Some(
                    get_first_string_arg(node)
                        .ok_or_else(|| ConfigError::MissingField("package reference".to_string()))?,
                );
            }
            "recipe" => {
                def.recipe_dir = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("recipe directory".to_string()))?;
            }
            "matrix" => parse_matrix(node, &mut def)?,
            "common-builds" => {
                def.pure_c = get_bool_prop(node, "pure-c").unwrap_or(false);
                def.shared_option_name = get_string_prop(node, "shared-option-name");
            }
            "build" => def.builds.push(parse_build(node)?),
            "remove-if" => def.remove_rules.push(RemoveRule::new(parse_condition(node)?)),
            "update-if" => {
                let condition = parse_condition(node)?;
                let update = parse_update(node)?;
                def.update_rules.push(UpdateRule::new(condition, update));
            }
            "docker" => {
                def.docker_image = get_string_prop(node, "image").or_else(|| get_first_string_arg(node));
                if def.docker_image.is_none() {
                    return Err(ConfigError::MissingField("docker image".to_string()));
                }
            }
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(def)
}

fn parse_matrix(node: &KdlNode, def: &mut MatrixDefinition) -> ConfigResult<()> {
    let Some(children) = node.children() else {
        return Ok(());
    };

    for child in children.nodes() {
        match child.name().value() {
            "cppstds" => def.cppstds = get_all_args(child),
            "archs" => def.archs = get_all_args(child),
            "build-types" | "build_types" => def.build_types = get_all_args(child),
            "os" => def.os = get_first_string_arg(child),
            "compiler" => {
                let mut args = get_all_args(child).into_iter();
                let family_name = args
                    .next()
                    .ok_or_else(|| ConfigError::MissingField("compiler family".to_string()))?;
                let family: CompilerFamily =
                    family_name
                        .parse()
                        .map_err(|_| ConfigError::InvalidValue {
                            field: "compiler".to_string(),
                            message: format!("unknown compiler family: {}", family_name),
                        })?;
                if def.compilers.iter().any(|c| c.family == family) {
                    return Err(ConfigError::Duplicate(format!("compiler {}", family)));
                }
                let versions: Vec<String> = args.collect();
                if versions.is_empty() {
                    return Err(ConfigError::MissingField(format!(
                        "versions for compiler {}",
                        family
                    )));
                }
                def.compilers.push(CompilerProfile::new(family, versions));
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_build(node: &KdlNode) -> ConfigResult<BuildEntry> {
    let mut entry = BuildEntry::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            let name = child.name().value();
            if !matches!(name, "setting" | "option" | "env") {
                continue;
            }
            let (key, value) = key_value(child)?;
            match name {
                "setting" => {
                    entry = entry.with_setting(key, option_value(value, "setting")?.to_string());
                }
                "option" => entry = entry.with_option(key, option_value(value, "option")?),
                "env" => entry = entry.with_env(key, option_value(value, "env")?.to_string()),
                _ => {}
            }
        }
    }
    if entry.settings.is_empty() {
        return Err(ConfigError::MissingField("settings for build".to_string()));
    }
    Ok(entry)
}

fn parse_condition(node: &KdlNode) -> ConfigResult<Condition> {
    let rule = node.name().value();
    let equals = || {
        node.get("equals")
            .ok_or_else(|| ConfigError::MissingField(format!("equals for {}", rule)))
    };

    if let Some(var) = get_string_prop(node, "env") {
        let value = value_to_string(equals()?).ok_or_else(|| ConfigError::InvalidValue {
            field: format!("{}.equals", rule),
            message: "expected a string".to_string(),
        })?;
        return Ok(Condition::EnvEquals { var, value });
    }
    if let Some(key) = get_string_prop(node, "setting") {
        let value = value_to_string(equals()?).ok_or_else(|| ConfigError::InvalidValue {
            field: format!("{}.equals", rule),
            message: "expected a string".to_string(),
        })?;
        return Ok(Condition::SettingEquals { key, value });
    }
    if let Some(key) = get_string_prop(node, "option") {
        let value = option_value(equals()?, rule)?;
        return Ok(Condition::OptionEquals { key, value });
    }
    if get_bool_prop(node, "always") == Some(true) {
        return Ok(Condition::Always);
    }

    Err(ConfigError::MissingField(format!(
        "condition for {} (env=, setting=, option= or always=#true)",
        rule
    )))
}

fn parse_update(node: &KdlNode) -> ConfigResult<BuildUpdate> {
    let mut update = BuildUpdate::default();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            let name = child.name().value();
            if !matches!(name, "setting" | "option" | "env") {
                continue;
            }
            let (key, value) = key_value(child)?;
            match name {
                "option" => {
                    update.options.insert(key, option_value(value, "option")?);
                }
                "setting" => {
                    update
                        .settings
                        .insert(key, option_value(value, "setting")?.to_string());
                }
                "env" => {
                    update
                        .env_vars
                        .insert(key, option_value(value, "env")?.to_string());
                }
                _ => {}
            }
        }
    }
    if update.is_empty() {
        return Err(ConfigError::MissingField(
            "options for update-if".to_string(),
        ));
    }
    Ok(update)
}

// Helper functions for extracting values from KDL nodes

fn positional_args(node: &KdlNode) -> impl Iterator<Item = &KdlValue> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .map(|e| e.value())
}

/// `name value` pair of a child like `option "CHM:with_mpi" #true`.
fn key_value(node: &KdlNode) -> ConfigResult<(String, &KdlValue)> {
    let mut args = positional_args(node);
    let key = args
        .next()
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
        .ok_or_else(|| ConfigError::MissingField(format!("{} name", node.name().value())))?;
    let value = args
        .next()
        .ok_or_else(|| ConfigError::MissingField(format!("value for {}", key)))?;
    Ok((key, value))
}

fn value_to_string(value: &KdlValue) -> Option<String> {
    if let Some(s) = value.as_string() {
        return Some(s.to_string());
    }
    if let Some(i) = value.as_integer() {
        return Some(i.to_string());
    }
    value.as_float().map(|f| f.to_string())
}

fn option_value(value: &KdlValue, field: &str) -> ConfigResult<OptionValue> {
    if let Some(b) = value.as_bool() {
        return Ok(OptionValue::Bool(b));
    }
    if let Some(i) = value.as_integer() {
        return i64::try_from(i)
            .map(OptionValue::Int)
            .map_err(|_| ConfigError::InvalidValue {
                field: field.to_string(),
                message: format!("integer out of range: {}", i),
            });
    }
    value_to_string(value)
        .map(OptionValue::Str)
        .ok_or_else(|| ConfigError::InvalidValue {
            field: field.to_string(),
            message: "null is not a valid value".to_string(),
        })
}

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    positional_args(node).find_map(|v| v.as_string().map(|s| s.to_string()))
}

fn get_all_args(node: &KdlNode) -> Vec<String> {
    positional_args(node).filter_map(value_to_string).collect()
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUNDLED: &str = include_str!("../../../pkgmatrix.kdl");

    fn mpi_env(value: &str) -> BuildEnvironment {
        BuildEnvironment::default().with("USE_MPI", value)
    }

    #[test]
    fn test_bundled_file_matches_builtin_definition() {
        let parsed = parse_definition(BUNDLED).unwrap();
        assert_eq!(parsed, MatrixDefinition::default());
    }

    #[test]
    fn test_builtin_with_mpi() {
        let matrix = MatrixDefinition::default()
            .build(&mpi_env("with-mpi"))
            .unwrap();

        // gcc 9 yields libstdc++ and libstdc++11; the old ABI is dropped
        assert_eq!(matrix.len(), 1);
        let entry = &matrix.entries()[0];
        assert_eq!(entry.setting("compiler.libcxx"), Some("libstdc++11"));
        assert_eq!(entry.setting("compiler.cppstd"), Some("14"));
        assert_eq!(entry.option("CHM:with_mpi"), Some(&OptionValue::Bool(true)));
        assert_eq!(
            entry.option("boost:without_mpi"),
            Some(&OptionValue::Bool(false))
        );
        assert_eq!(
            entry.option("trilinos:with_mpi"),
            Some(&OptionValue::Bool(true))
        );
    }

    #[test]
    fn test_builtin_without_mpi() {
        let matrix = MatrixDefinition::default()
            .build(&mpi_env("no"))
            .unwrap();
        assert_eq!(matrix.len(), 1);
        assert!(matrix.entries()[0].options.is_empty());
    }

    #[test]
    fn test_builtin_missing_use_mpi_fails() {
        let err = MatrixDefinition::default()
            .build(&BuildEnvironment::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnv(ref v) if v == "USE_MPI"));
    }

    #[test]
    fn test_compilers_from_env() {
        let env = mpi_env("no")
            .with("CONAN_GCC_VERSIONS", "7,9")
            .with("CONAN_CLANG_VERSIONS", "10");
        let def = MatrixDefinition::default();
        let compilers = def.resolve_compilers(&env);
        assert_eq!(compilers.len(), 2);
        assert_eq!(compilers[0].versions, vec!["7", "9"]);

        // gcc 7, gcc 9 and clang 10 keep one entry each after filtering
        assert_eq!(def.build(&env).unwrap().len(), 3);
    }

    #[test]
    fn test_dimension_from_env_and_missing() {
        let mut def = MatrixDefinition::default();
        def.archs.clear();

        let err = def.build(&mpi_env("no")).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let env = mpi_env("no").with("CONAN_ARCHS", "x86_64,armv8");
        assert_eq!(def.build(&env).unwrap().len(), 2);
    }

    #[test]
    fn test_parse_full_definition() {
        let kdl = r#"
            package "CHM/${env.CHM_VERSION}@chm/stable"
            recipe "conan"

            matrix {
                cppstds 14 17
                archs "x86_64"
                build-types "Release" "Debug"
                compiler "gcc" "7" 9
                compiler "clang" "10"
                os "Linux"
            }

            common-builds pure-c=#false shared-option-name="CHM:shared"

            build {
                setting "compiler" "gcc"
                setting "compiler.version" "11"
                option "CHM:with_mpi" #false
            }

            remove-if setting="compiler.libcxx" equals="libstdc++"
            remove-if option="CHM:shared" equals=#true

            update-if env="USE_MPI" equals="with-mpi" {
                option "CHM:with_mpi" #true
                env "OMPI_CC" "gcc"
            }

            docker image="conanio/gcc9"
        "#;

        let def = parse_definition(kdl).unwrap();
        assert_eq!(def.reference.as_deref(), Some("CHM/${env.CHM_VERSION}@chm/stable"));
        assert_eq!(def.recipe_dir, "conan");
        assert_eq!(def.cppstds, vec!["14", "17"]);
        assert_eq!(def.build_types, vec!["Release", "Debug"]);
        assert_eq!(def.compilers[0].versions, vec!["7", "9"]);
        assert_eq!(def.os.as_deref(), Some("Linux"));
        assert_eq!(def.shared_option_name.as_deref(), Some("CHM:shared"));
        assert_eq!(def.builds.len(), 1);
        assert_eq!(def.remove_rules.len(), 2);
        assert_eq!(
            def.remove_rules[1].condition,
            Condition::OptionEquals {
                key: "CHM:shared".to_string(),
                value: OptionValue::Bool(true)
            }
        );
        assert_eq!(def.update_rules[0].update.env_vars["OMPI_CC"], "gcc");
        assert_eq!(def.docker_image.as_deref(), Some("conanio/gcc9"));

        let env = mpi_env("with-mpi").with("CHM_VERSION", "1.2");
        let reference = def.reference(&env).unwrap().unwrap();
        assert_eq!(reference.to_string(), "CHM/1.2@chm/stable");

        let matrix = def.build(&env).unwrap();
        // shared=True entries and the old ABI are gone
        assert!(matrix.entries().iter().all(|e| {
            e.option("CHM:shared") != Some(&OptionValue::Bool(true))
                && e.setting("compiler.libcxx") != Some("libstdc++")
        }));
        // The explicit build survives and is updated too
        let explicit = matrix
            .entries()
            .iter()
            .find(|e| e.setting("compiler.version") == Some("11"))
            .unwrap();
        assert_eq!(explicit.option("CHM:with_mpi"), Some(&OptionValue::Bool(true)));
    }

    #[test]
    fn test_reference_from_env() {
        let def = MatrixDefinition::default();
        let env = BuildEnvironment::default()
            .with("CONAN_REFERENCE", "CHM/1.0")
            .with("CONAN_USERNAME", "chm")
            .with("CONAN_CHANNEL", "testing");
        let reference = def.reference(&env).unwrap().unwrap();
        assert_eq!(reference.to_string(), "CHM/1.0@chm/testing");

        assert!(def.reference(&BuildEnvironment::default()).unwrap().is_none());
    }

    #[test]
    fn test_invalid_reference() {
        let def = parse_definition(r#"package "not a reference""#).unwrap();
        assert!(matches!(
            def.reference(&BuildEnvironment::default()),
            Err(ConfigError::Core(_))
        ));
    }

    #[test]
    fn test_docker_image_from_env() {
        let def = MatrixDefinition::default();
        let env = BuildEnvironment::default().with("CONAN_DOCKER_IMAGE", "conanio/gcc9");
        assert_eq!(
            def.docker_image(&env).unwrap().as_deref(),
            Some("conanio/gcc9")
        );
        assert!(def.docker_image(&BuildEnvironment::default()).unwrap().is_none());
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            parse_definition("matrix {"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            parse_definition(r#"remove-if setting="compiler.libcxx""#),
            Err(ConfigError::MissingField(_))
        ));
        assert!(matches!(
            parse_definition(r#"remove-if"#),
            Err(ConfigError::MissingField(_))
        ));
        assert!(matches!(
            parse_definition(r#"update-if always=#true"#),
            Err(ConfigError::MissingField(_))
        ));
        assert!(matches!(
            parse_definition("matrix {\n compiler \"msvc\" \"16\"\n}"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            parse_definition("matrix {\n compiler \"gcc\" \"9\"\n compiler \"gcc\" \"10\"\n}"),
            Err(ConfigError::Duplicate(_))
        ));
        assert!(matches!(
            parse_definition("package \"A/1\"\npackage \"B/1\""),
            Err(ConfigError::Duplicate(_))
        ));
    }

    #[test]
    fn test_pure_c_ignores_cppstds() {
        let kdl = r#"
            matrix {
                archs "x86_64"
                build-types "Release"
                compiler "gcc" "9"
            }
            common-builds pure-c=#true
        "#;
        let def = parse_definition(kdl).unwrap();
        let matrix = def.build(&BuildEnvironment::default()).unwrap();
        assert_eq!(matrix.len(), 1);
        assert!(matrix.entries()[0].setting("compiler.libcxx").is_none());
    }
}
