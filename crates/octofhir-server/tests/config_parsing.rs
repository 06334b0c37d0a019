use std::{env, fs};

use octofhir_server::config::loader::load_config;

#[test]
fn config_parsing_and_env_overrides_and_validation() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("octofhir.toml");

    let toml_content = r#"
[server]
host = "127.0.0.1"
port = 8081
base_url = "https://fhir.example.org"

[logging]
level = "debug"
log_stream_steps = true

[redis]
enabled = true
url = "redis://cache:6379"
timeout_ms = 250

[stream_cache]
ttl_secs = 600
batch_size = 50
read_enabled = true
write_enabled = true

[streaming]
channel_capacity = 8
default_bundle = false

[storage]
seed_path = "data/seed.ndjson"
"#;
    fs::write(&path, toml_content).expect("write toml");

    // 1) Valid config parses
    let cfg = load_config(path.to_str()).expect("should parse config");
    assert_eq!(cfg.server.port, 8081);
    assert_eq!(cfg.base_url(), "https://fhir.example.org");
    assert!(cfg.logging.log_stream_steps);
    assert!(cfg.redis.enabled);
    assert_eq!(cfg.redis.timeout_ms, 250);
    assert!(!cfg.redis.reconnect_on_failure);
    assert_eq!(cfg.stream_cache.ttl_secs, 600);
    assert_eq!(cfg.stream_cache.batch_size, 50);
    assert_eq!(cfg.stream_cache.read_block_ms, 1000);
    assert!(cfg.stream_cache.read_enabled && cfg.stream_cache.write_enabled);
    assert_eq!(cfg.streaming.channel_capacity, 8);
    assert!(!cfg.streaming.default_bundle);
    assert_eq!(cfg.storage.seed_path.as_deref(), Some("data/seed.ndjson"));

    // 2) Env override should win over file
    unsafe {
        env::set_var("OCTOFHIR__STREAM_CACHE__BATCH_SIZE", "7");
    }
    let cfg_env = load_config(path.to_str()).expect("should parse config with env overrides");
    assert_eq!(cfg_env.stream_cache.batch_size, 7);
    unsafe {
        env::remove_var("OCTOFHIR__STREAM_CACHE__BATCH_SIZE");
    }

    // 3) Invalid values are rejected
    let bad = dir.path().join("bad.toml");
    fs::write(&bad, "[stream_cache]\nttl_secs = 0\n").expect("write toml");
    let err = load_config(bad.to_str()).unwrap_err();
    assert!(err.contains("ttl_secs"), "unexpected error: {err}");

    // 4) A missing file falls back to defaults
    let missing = dir.path().join("absent.toml");
    let cfg = load_config(missing.to_str()).expect("defaults");
    assert_eq!(cfg.server.port, 8080);
    assert!(!cfg.redis.enabled);
}
