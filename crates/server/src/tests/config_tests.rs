use super::{
    load_settings_from, load_static_ledger, normalize_database_url, prepare_database_url,
    Settings, DEFAULT_MAX_BODY_BYTES,
};

use std::{collections::HashMap, fs};

use shared::domain::Cell;

fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| vars.get(key).cloned()
}

#[test]
fn defaults_apply_without_file_or_env() {
    let settings = load_settings_from(None, env_of(&[]));
    assert_eq!(settings, Settings::default());
    assert_eq!(settings.grid_width, 100);
    assert_eq!(settings.max_body_bytes, DEFAULT_MAX_BODY_BYTES);
    assert_eq!(settings.finalize_max_attempts, 5);
}

#[test]
fn file_values_are_overridden_by_env() {
    let file = r#"
        bind_addr = "0.0.0.0:9000"
        database_url = "sqlite://./file.db"
        grid_width = 40
        grid_height = 25
        static_ledger_path = "data/purchasedBlocks.json"
    "#;
    let settings = load_settings_from(
        Some(file),
        env_of(&[
            ("SERVER_BIND", "127.0.0.1:1"),
            ("APP__BIND_ADDR", "127.0.0.1:2"),
            ("DATABASE_URL", "sqlite://./env.db"),
            ("APP__GRID_HEIGHT", "30"),
            ("APP__FINALIZE_MAX_ATTEMPTS", "9"),
        ]),
    );
    assert_eq!(settings.server_bind, "127.0.0.1:2");
    assert_eq!(settings.database_url, "sqlite://./env.db");
    assert_eq!(settings.grid_width, 40);
    assert_eq!(settings.grid_height, 30);
    assert_eq!(
        settings.static_ledger_path.as_deref(),
        Some("data/purchasedBlocks.json")
    );
    assert_eq!(settings.finalize_max_attempts, 9);
}

#[test]
fn unparsable_overrides_and_files_are_ignored() {
    let settings = load_settings_from(
        Some("this is = = not toml"),
        env_of(&[("APP__MAX_BODY_BYTES", "lots"), ("APP__STATIC_LEDGER_PATH", " ")]),
    );
    assert_eq!(settings, Settings::default());
}

#[test]
fn grid_size_must_be_positive_and_addressable() {
    let settings = load_settings_from(
        None,
        env_of(&[("APP__GRID_WIDTH", "0"), ("APP__GRID_HEIGHT", "50")]),
    );
    assert_eq!(settings.grid_width, 100);
    assert_eq!(settings.grid_height, 50);

    let settings = load_settings_from(Some("grid_width = 0"), env_of(&[]));
    assert_eq!(settings.grid_width, 100);

    // 70_000 * 70_000 does not fit a u32 cell id.
    let settings = load_settings_from(
        None,
        env_of(&[("APP__GRID_WIDTH", "70000"), ("APP__GRID_HEIGHT", "70000")]),
    );
    assert_eq!((settings.grid_width, settings.grid_height), (100, 100));
}

#[test]
fn normalizes_plain_file_path_to_sqlite_url() {
    assert_eq!(
        normalize_database_url("./data/test.db"),
        "sqlite://./data/test.db"
    );
    assert_eq!(normalize_database_url("sqlite:grid.db"), "sqlite://grid.db");
    assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
    assert_eq!(normalize_database_url("  "), Settings::default().database_url);
}

#[test]
fn creates_parent_dir_for_sqlite_url() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("data").join("test.db");

    prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare db url");
    assert!(temp_root.path().join("data").exists());
}

#[tokio::test]
async fn prepared_database_url_creates_openable_sqlite_file() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("nested").join("server.db");

    let prepared = prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare");
    let storage = storage::Storage::new(&prepared).await.expect("open sqlite");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should be created: {}",
        db_path.display()
    );
}

#[test]
fn static_ledger_loading_tolerates_missing_file_only() {
    let dir = tempfile::tempdir().expect("tempdir");

    assert_eq!(load_static_ledger(None).expect("none"), Default::default());
    let missing = dir.path().join("missing.json");
    let ledger = load_static_ledger(missing.to_str()).expect("missing");
    assert!(ledger.regions.is_empty());

    let flat = dir.path().join("flat.json");
    fs::write(&flat, r#"{ "12": { "imageUrl": "https://a/b.png", "linkUrl": "https://a" } }"#)
        .expect("write");
    let ledger = load_static_ledger(flat.to_str()).expect("flat");
    assert!(ledger.cells.contains_key(&Cell(12)));

    let broken = dir.path().join("broken.json");
    fs::write(&broken, "{ nope").expect("write");
    assert!(load_static_ledger(broken.to_str()).is_err());
}
