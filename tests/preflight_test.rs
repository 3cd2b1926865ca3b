use refresh_golem::config::GolemConfig;
use refresh_golem::preflight::{run_preflight, PreflightScope};

fn config_with_commands(metrics: &[&str], generator: &[&str]) -> GolemConfig {
    let mut config = GolemConfig::default();
    config.metrics.command = metrics.iter().map(|s| s.to_string()).collect();
    config.generator.command = generator.iter().map(|s| s.to_string()).collect();
    config
}

fn project_with_catalog() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("catalog.jsonl"), "").unwrap();
    dir
}

#[test]
fn prioritize_passes_with_catalog_and_fetcher() {
    let dir = project_with_catalog();
    let config = config_with_commands(&["sh", "-c", "true"], &[]);
    assert!(run_preflight(&config, dir.path(), PreflightScope::Prioritize).is_ok());
}

#[test]
fn generate_scope_also_requires_generator() {
    let dir = project_with_catalog();
    let config = config_with_commands(&["sh"], &[]);
    let errors = run_preflight(&config, dir.path(), PreflightScope::Generate).unwrap_err();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].config_location.contains("generator.command"));
}

#[test]
fn missing_catalog_and_fetcher_are_all_reported() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_with_commands(&[], &[]);
    let errors = run_preflight(&config, dir.path(), PreflightScope::Prioritize).unwrap_err();
    assert_eq!(errors.len(), 2);
    assert!(errors[0].condition.contains("Catalog file not found"));
    assert!(errors[1].condition.contains("metrics.command is not configured"));
}

#[test]
fn unknown_program_is_reported() {
    let dir = project_with_catalog();
    let config = config_with_commands(&["no-such-fetcher-4242"], &[]);
    let errors = run_preflight(&config, dir.path(), PreflightScope::Prioritize).unwrap_err();
    assert!(errors[0].condition.contains("no-such-fetcher-4242"));
    let rendered = errors[0].to_string();
    assert!(rendered.starts_with("Preflight error:"));
    assert!(rendered.contains("Fix:"));
}
