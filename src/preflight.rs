use std::path::Path;

use crate::config::{GolemConfig, CONFIG_FILE};

/// A single preflight validation error with actionable context.
#[derive(Debug, Clone, PartialEq)]
pub struct PreflightError {
    /// What condition failed.
    pub condition: String,
    /// Where in the config the error originates.
    pub config_location: String,
    /// How to fix it.
    pub suggested_fix: String,
}

impl std::fmt::Display for PreflightError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Preflight error: {}\n  Config: {}\n  Fix: {}",
            self.condition, self.config_location, self.suggested_fix
        )
    }
}

/// Which kind of work is about to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreflightScope {
    /// Batch prioritization: needs the catalog and the metrics fetcher.
    Prioritize,
    /// Analyze-one or draft-one: additionally needs the generator.
    Generate,
}

/// Run the preflight checks for `scope`.
///
/// Returns `Ok(())` if all checks pass, or `Err(Vec<PreflightError>)` with all errors.
pub fn run_preflight(
    config: &GolemConfig,
    project_root: &Path,
    scope: PreflightScope,
) -> Result<(), Vec<PreflightError>> {
    let mut errors = Vec::new();

    let catalog_path = config.catalog_path(project_root);
    if !catalog_path.is_file() {
        errors.push(PreflightError {
            condition: format!("Catalog file not found: {}", catalog_path.display()),
            config_location: format!("{} → project.catalog_path", CONFIG_FILE),
            suggested_fix: "Export the content catalog as JSON lines to that path, or point catalog_path at it".to_string(),
        });
    }

    errors.extend(check_command(
        &config.metrics.command,
        "metrics.command",
        "Set metrics.command to the argv of a fetcher that prints {clicks, impressions, ctr, position} JSON",
    ));

    if scope == PreflightScope::Generate {
        errors.extend(check_command(
            &config.generator.command,
            "generator.command",
            "Set generator.command to the argv of a tool that reads a prompt on stdin and prints the text",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// A configured argv must be non-empty and its program must resolve.
fn check_command(argv: &[String], location: &str, fix: &str) -> Option<PreflightError> {
    let Some(program) = argv.first().filter(|p| !p.trim().is_empty()) else {
        return Some(PreflightError {
            condition: format!("{} is not configured", location),
            config_location: format!("{} → {}", CONFIG_FILE, location),
            suggested_fix: fix.to_string(),
        });
    };

    if program_exists(program) {
        None
    } else {
        Some(PreflightError {
            condition: format!("Program \"{}\" not found", program),
            config_location: format!("{} → {}", CONFIG_FILE, location),
            suggested_fix: "Install the program or use an absolute path".to_string(),
        })
    }
}

/// Paths are checked directly; bare names are looked up on `PATH`.
fn program_exists(program: &str) -> bool {
    let path = Path::new(program);
    if path.components().count() > 1 {
        return path.is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}
