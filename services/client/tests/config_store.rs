/// Config and status file behavior: URL validation, createdAt preservation,
/// status lifecycle.
use client::config::{ConfigError, ConfigStore, ConnectionStatus};

fn temp_store() -> (tempfile::TempDir, ConfigStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = ConfigStore::new(dir.path().join("outpost"));
    (dir, store)
}

#[test]
fn init_then_load_round_trips_the_domain() {
    let (_guard, store) = temp_store();

    let written = store.init("https://edge.example.com").unwrap();
    let loaded = store.load().unwrap();
    assert_eq!(loaded, written);
    assert_eq!(loaded.domain, "https://edge.example.com");
    assert!(!loaded.created_at.is_empty());
    assert!(!loaded.updated_at.is_empty());
}

#[test]
fn reinit_preserves_created_at_and_bumps_updated_at() {
    let (_guard, store) = temp_store();

    let first = store.init("https://edge.example.com").unwrap();
    std::thread::sleep(std::time::Duration::from_millis(10));
    let second = store.init("https://other.example.com").unwrap();

    assert_eq!(second.created_at, first.created_at);
    assert_ne!(second.updated_at, first.updated_at);
    assert_eq!(store.load().unwrap().domain, "https://other.example.com");
}

#[test]
fn init_trims_one_trailing_slash() {
    let (_guard, store) = temp_store();
    let config = store.init("http://edge.example.com:3001/").unwrap();
    assert_eq!(config.domain, "http://edge.example.com:3001");
}

#[test]
fn init_rejects_non_http_urls() {
    let (_guard, store) = temp_store();

    assert!(matches!(
        store.init("ftp://edge.example.com"),
        Err(ConfigError::InvalidScheme(_))
    ));
    assert!(matches!(
        store.init("edge.example.com"),
        Err(ConfigError::InvalidScheme(_))
    ));
    assert!(matches!(
        store.init("http://"),
        Err(ConfigError::Unparseable(_, _))
    ));

    // Nothing was written on failure.
    assert!(matches!(store.load(), Err(ConfigError::NotConfigured)));
}

#[test]
fn load_without_config_reports_not_configured() {
    let (_guard, store) = temp_store();
    assert!(matches!(store.load(), Err(ConfigError::NotConfigured)));
}

#[test]
fn status_file_lifecycle() {
    let (_guard, store) = temp_store();
    assert_eq!(store.read_status().unwrap(), None);

    let status = ConnectionStatus {
        connected: true,
        connected_at: client::config::now_timestamp(),
        port: 3000,
        domain: "https://edge.example.com".to_owned(),
    };
    store.write_status(&status).unwrap();
    assert_eq!(store.read_status().unwrap(), Some(status));

    store.clear_status().unwrap();
    assert_eq!(store.read_status().unwrap(), None);
    // Clearing twice is fine.
    store.clear_status().unwrap();
}
