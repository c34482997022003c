use super::*;
use shared::domain::{Cell, SoldRecord};

async fn file_storage(dir: &tempfile::TempDir) -> Storage {
    let db_path = dir.path().join("grid.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));
    Storage::new(&database_url).await.expect("db")
}

fn record(image: &str) -> SoldRecord {
    SoldRecord {
        image_url: image.to_string(),
        link_url: "https://example.com".to_string(),
        name: "test".to_string(),
        sold_at: 1,
    }
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("nested").join("storage.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );
}

#[test]
fn sqlite_path_ignores_memory_and_foreign_urls() {
    assert_eq!(sqlite_path("sqlite::memory:"), None);
    assert_eq!(sqlite_path("postgres://localhost/db"), None);
    assert_eq!(
        sqlite_path("sqlite://./data/grid.db?mode=rwc"),
        Some(PathBuf::from("./data/grid.db"))
    );
}

#[tokio::test]
async fn empty_store_loads_default_grid_at_version_zero() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let grid = storage.load_grid().await.expect("load");
    assert_eq!(grid.version, 0);
    assert!(grid.document.sold.is_empty());
    assert!(grid.document.locks.is_empty());
}

#[tokio::test]
async fn save_with_stale_version_is_a_conflict() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");

    let mut document = GridDocument::default();
    document.sold.insert(Cell(3), record("https://img/a.png"));
    let first = storage.save_grid(&document, 0).await.expect("first save");
    assert_eq!(first, SaveOutcome::Saved { version: 1 });

    // A second writer that also read version 0 must lose.
    let mut rival = GridDocument::default();
    rival.sold.insert(Cell(3), record("https://img/b.png"));
    let stale = storage.save_grid(&rival, 0).await.expect("stale save");
    assert_eq!(stale, SaveOutcome::Conflict);

    let loaded = storage.load_grid().await.expect("load");
    assert_eq!(loaded.version, 1);
    assert_eq!(loaded.document, document);

    let second = storage.save_grid(&rival, 1).await.expect("second save");
    assert_eq!(second, SaveOutcome::Saved { version: 2 });
    let stale_again = storage.save_grid(&document, 1).await.expect("stale");
    assert_eq!(stale_again, SaveOutcome::Conflict);
}

#[tokio::test]
async fn reservations_round_trip_through_the_grid_document() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let id = ReservationId::generate();
    let reservation = Reservation {
        blocks: vec![Cell(1), Cell(2)],
        expires_at: Some(42),
    };

    storage
        .put_reservation(&id, reservation.clone())
        .await
        .expect("put");
    let loaded = storage.load_grid().await.expect("load");
    assert_eq!(loaded.document.locks.get(&id), Some(&reservation));

    assert!(storage.remove_reservation(&id).await.expect("remove"));
    assert!(!storage.remove_reservation(&id).await.expect("remove again"));
    let loaded = storage.load_grid().await.expect("load");
    assert!(loaded.document.locks.is_empty());
    assert_eq!(loaded.version, 2);
}

#[tokio::test]
async fn malformed_document_is_reported_not_replaced() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage
        .compare_and_swap_blob(GRID_STATE_KEY, 0, "not json")
        .await
        .expect("raw write");

    let err = storage.load_grid().await.expect_err("should fail");
    assert!(err.to_string().contains("not valid JSON"), "{err}");
}

#[tokio::test]
async fn concurrent_updates_are_all_applied() {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = file_storage(&dir).await;

    let mut tasks = Vec::new();
    for n in 0..6u32 {
        let storage = storage.clone();
        tasks.push(tokio::spawn(async move {
            storage
                .update_grid(|document| {
                    document
                        .sold
                        .insert(Cell(n), record(&format!("https://img/{n}.png")));
                })
                .await
        }));
    }
    for task in tasks {
        task.await.expect("join").expect("update");
    }

    let loaded = storage.load_grid().await.expect("load");
    assert_eq!(loaded.document.sold.len(), 6);
    assert_eq!(loaded.version, 6);
}
