//! Config hash stability
//!
//! GREEN when:
//! - `load_layered_yaml_from_strings` called twice on the same inputs returns
//!   identical config_hash.
//! - Reordering keys within YAML doesn't change the hash (canonicalization).
//! - An overlay that changes a value changes the hash.

use mb_config::load_layered_yaml_from_strings;

const BASE_YAML: &str = r#"
debug: false
database:
  url_env: "MB_DATABASE_URL"
  max_connections: 8
retry:
  base_delay_secs: 60
  max_delay_secs: 3600
"#;

const BASE_YAML_REORDERED: &str = r#"
retry:
  max_delay_secs: 3600
  base_delay_secs: 60
database:
  max_connections: 8
  url_env: "MB_DATABASE_URL"
debug: false
"#;

const OVERLAY_YAML: &str = r#"
retry:
  base_delay_secs: 30
"#;

#[test]
fn same_input_produces_identical_hash() {
    let a = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    let b = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();

    assert_eq!(a.config_hash, b.config_hash);
    assert_eq!(a.canonical_json, b.canonical_json);
}

#[test]
fn reordered_keys_produce_same_hash() {
    let original = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    let reordered = load_layered_yaml_from_strings(&[BASE_YAML_REORDERED]).unwrap();

    assert_eq!(
        original.config_hash, reordered.config_hash,
        "reordering keys in YAML must not change the hash"
    );
}

#[test]
fn overlay_changes_hash_and_value() {
    let base = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    let layered = load_layered_yaml_from_strings(&[BASE_YAML, OVERLAY_YAML]).unwrap();

    assert_ne!(base.config_hash, layered.config_hash);

    let settings = layered.settings().unwrap();
    assert_eq!(settings.retry.base_delay_secs, 30);
    assert_eq!(settings.retry.max_delay_secs, 3600);
    assert_eq!(settings.database.max_connections, 8);
}

#[test]
fn hash_is_hex_sha256() {
    let cfg = load_layered_yaml_from_strings(&[BASE_YAML]).unwrap();
    assert_eq!(cfg.config_hash.len(), 64);
    assert!(cfg.config_hash.chars().all(|c| c.is_ascii_hexdigit()));
}
