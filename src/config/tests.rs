use super::ProxyConfig;
use std::path::Path;

#[test]
fn test_defaults_without_file() {
    let cfg = ProxyConfig::load(Path::new("/nonexistent/config.toml")).unwrap();
    assert_eq!(cfg.port, 8080);
    assert_eq!(cfg.stream_ttl_seconds, 86_400);
    assert_eq!(cfg.url_ttl_seconds, 604_800);
    assert_eq!(cfg.batch_size_bytes, 4096);
    assert_eq!(cfg.batch_time_ms, 50);
}

#[test]
fn test_load_toml_config() {
    let toml = r#"
        port = 9090
        store_url = "http://store.internal:9000"
        allowlist = ["https://api.example.com/**"]
        secret = "s3cr3t"
    "#;
    let tmp = std::env::temp_dir().join("streamproxy_test_config.toml");
    std::fs::write(&tmp, toml).unwrap();
    let cfg = ProxyConfig::load(&tmp).unwrap();
    assert_eq!(cfg.port, 9090);
    assert_eq!(cfg.store_url, "http://store.internal:9000");
    assert_eq!(cfg.allowlist, vec!["https://api.example.com/**".to_string()]);
    std::fs::remove_file(&tmp).ok();
}

#[test]
fn test_load_json_config() {
    let json = r#"{
        "port": 8081,
        "store_url": "http://127.0.0.1:9000",
        "allowlist": ["https://*.example.com/**"],
        "secret": "abc"
    }"#;
    let tmp = std::env::temp_dir().join("streamproxy_test_config.json");
    std::fs::write(&tmp, json).unwrap();
    let cfg = ProxyConfig::load(&tmp).unwrap();
    assert_eq!(cfg.port, 8081);
    assert_eq!(cfg.allowlist.len(), 1);
    std::fs::remove_file(&tmp).ok();
}

#[test]
fn test_rejects_invalid_allowlist_pattern() {
    let mut cfg = ProxyConfig::default();
    cfg.allowlist.push("[".to_string());
    assert!(cfg.validate().is_err());
}

#[test]
fn test_env_overrides_applied() {
    std::env::set_var("PROXY_SECRET", "from-env");
    let mut cfg = ProxyConfig::default();
    cfg.apply_env_overrides();
    assert_eq!(cfg.secret, "from-env");
    std::env::remove_var("PROXY_SECRET");
}
