//! Integration tests for CLI config command
//!
//! Tests file I/O operations for the `promhook config` subcommand.
//! Verifies template generation, file writing, and error handling.

use promhook::cli::generate_config_template;
use promhook::config::Config;
use promhook::handlers::AppState;
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

/// Helper to create temporary directory for file operations
fn create_temp_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp directory")
}

// ─────────────────────────────────────────────────────────────────────────────
// Template Content Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_generated_template_creates_valid_config_file() {
    let temp_dir = create_temp_dir();
    let config_path = temp_dir.path().join("config.toml");

    let template = generate_config_template();
    fs::write(&config_path, template).expect("Failed to write template");

    let config =
        Config::from_file(&config_path).expect("Generated template should load as valid Config");

    assert_eq!(config.models.len(), 1);
    assert_eq!(config.databases[0].vendor, "postgresql");
    assert!(config.export.standalone_enabled());
    assert!(config.export.auth.is_none());
}

#[test]
fn test_template_config_builds_app_state() {
    let temp_dir = create_temp_dir();
    let config_path = temp_dir.path().join("config.toml");
    fs::write(&config_path, generate_config_template()).expect("Failed to write template");

    let config = Config::from_file(&config_path).expect("Failed to load config");
    let state = AppState::new(Arc::new(config)).expect("template should build a registry");

    assert!(state.auth().is_open());
    assert!(state.shard().is_none());
}

#[test]
fn test_template_file_content_matches_generation() {
    let temp_dir = create_temp_dir();
    let config_path = temp_dir.path().join("config.toml");

    let template = generate_config_template();
    fs::write(&config_path, template).expect("Failed to write template");

    let content = fs::read_to_string(&config_path).expect("Failed to read back");
    assert_eq!(content, template);
}

#[test]
fn test_template_includes_documentation() {
    let template = generate_config_template();

    assert!(template.contains("# "), "Template should have comments");
    assert!(template.contains("promhook"), "Template should have header");
    assert!(
        template.contains("PROMHOOK_WORKER_ID"),
        "Template should document the worker id fallback"
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// File Operation Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_write_to_nonexistent_parent_fails() {
    let temp_dir = create_temp_dir();
    let bad_path = temp_dir.path().join("nonexistent").join("config.toml");

    let result = fs::write(&bad_path, "test");
    assert!(result.is_err());
    assert_eq!(result.unwrap_err().kind(), std::io::ErrorKind::NotFound);
}

#[test]
fn test_template_roundtrip_preserves_config() {
    let temp_dir = create_temp_dir();
    let config_path = temp_dir.path().join("config.toml");

    let template = generate_config_template();
    fs::write(&config_path, template).expect("Failed to write template");

    let config = Config::from_file(&config_path).expect("Failed to load config");

    assert_eq!(config.export.address, "0.0.0.0");
    assert_eq!(config.export.timeout_seconds, 10);
    assert_eq!(config.metrics.latency_buckets.len(), 16);
    assert_eq!(config.pushgateway.url, "http://localhost:9091");
    assert_eq!(config.observability.log_level, "info");
}
