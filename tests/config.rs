use std::fs;

use groundwork::config::load_config;
use tempfile::TempDir;

#[test]
fn test_example_config_loads() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("config/gw.example.toml");
    let config = load_config(&path).unwrap();
    assert_eq!(config.embedding.provider, "hashing");
    assert_eq!(config.retrieval.top_k, 5);
    assert!(config.documents.include_globs.iter().any(|g| g == "**/*.md"));
}

#[test]
fn test_missing_file_names_path() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("absent.toml");
    let err = format!("{:#}", load_config(&path).unwrap_err());
    assert!(err.contains("absent.toml"), "{}", err);
}

#[test]
fn test_malformed_toml_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("gw.toml");
    fs::write(&path, "[db\npath = ").unwrap();
    let err = format!("{:#}", load_config(&path).unwrap_err());
    assert!(err.contains("Failed to parse config file"), "{}", err);
}

#[test]
fn test_missing_db_section_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("gw.toml");
    fs::write(&path, "[embedding]\nprovider = \"hashing\"\n").unwrap();
    assert!(load_config(&path).is_err());
}

#[test]
fn test_overlap_must_be_smaller_than_chunk() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("gw.toml");
    fs::write(
        &path,
        "[db]\npath = \"./gw.sqlite\"\n\n[chunking]\nmax_chunk_size = 100\noverlap_tokens = 100\n",
    )
    .unwrap();
    let err = load_config(&path).unwrap_err().to_string();
    assert!(err.contains("overlap_tokens"), "{}", err);
}
