//! CLI command implementations.

pub mod run;

use anyhow::{Context, Result};
use pkgmatrix_config::{BuildEnvironment, MatrixDefinition, parse_definition};
use pkgmatrix_core::BuildMatrix;
use std::path::Path;
use tracing::{info, warn};

/// Read the definition at `path`, or the built-in one if there is no such file.
pub fn load_definition(path: &str) -> Result<MatrixDefinition> {
    if !Path::new(path).exists() {
        info!(path, "No matrix definition found, using the built-in one");
        return Ok(MatrixDefinition::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path))?;
    parse_definition(&content)
        .with_context(|| format!("Failed to parse matrix definition: {}", path))
}

/// Load the definition and build its matrix, narrowed to one page if asked.
///
/// `page` comes from the command line; without it `CONAN_CURRENT_PAGE` and
/// `CONAN_TOTAL_PAGES` are used.
pub fn finalized_matrix(
    path: &str,
    env: &BuildEnvironment,
    page: Option<(usize, usize)>,
) -> Result<(MatrixDefinition, BuildMatrix)> {
    let definition = load_definition(path)?;
    let mut matrix = definition
        .build(env)
        .context("Failed to build the matrix")?;

    if let Some((current, total)) = resolve_page(page, env)? {
        matrix
            .page(current, total)
            .with_context(|| format!("Failed to select page {} of {}", current, total))?;
        info!(current, total, builds = matrix.len(), "Selected page");
    }
    Ok((definition, matrix))
}

/// Page from the flags, else from `CONAN_CURRENT_PAGE`/`CONAN_TOTAL_PAGES`.
fn resolve_page(
    flags: Option<(usize, usize)>,
    env: &BuildEnvironment,
) -> Result<Option<(usize, usize)>> {
    if flags.is_some() {
        return Ok(flags);
    }
    match (
        env.usize("CONAN_CURRENT_PAGE")?,
        env.usize("CONAN_TOTAL_PAGES")?,
    ) {
        (Some(current), Some(total)) => Ok(Some((current, total))),
        (None, None) => Ok(None),
        _ => anyhow::bail!("CONAN_CURRENT_PAGE and CONAN_TOTAL_PAGES must be set together"),
    }
}

pub fn show(path: &str, json: bool, page: Option<(usize, usize)>) -> Result<()> {
    let env = BuildEnvironment::capture();
    let (_, matrix) = finalized_matrix(path, &env, page)?;

    if json {
        println!("{}", serde_json::to_string_pretty(matrix.entries())?);
        return Ok(());
    }

    println!("{} build(s)", matrix.len());
    for (index, entry) in matrix.entries().iter().enumerate() {
        println!("  {:>3}. {}", index + 1, entry.label());
    }
    Ok(())
}

pub fn validate(path: &str) -> Result<()> {
    if !Path::new(path).exists() {
        anyhow::bail!("Config file not found: {}", path);
    }
    let definition = load_definition(path)?;

    // Missing variables are reported here; `run` fails on them
    if let Err(e) = definition.check_environment(&BuildEnvironment::capture()) {
        warn!(error = %e, "Definition needs variables missing from this environment");
    }

    println!("Configuration is valid");
    println!(
        "  {} remove rule(s), {} update rule(s), {} explicit build(s)",
        definition.remove_rules.len(),
        definition.update_rules.len(),
        definition.builds.len()
    );
    Ok(())
}
