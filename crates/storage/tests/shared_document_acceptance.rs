use shared::domain::{Cell, GridDocument, Reservation, ReservationId, SoldRecord};
use storage::{GridStore, SaveOutcome, Storage};

fn database_url(dir: &tempfile::TempDir) -> String {
    let db_path = dir.path().join("shared.db");
    format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"))
}

#[tokio::test]
async fn two_instances_see_one_document_and_cannot_overwrite_each_other() {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = database_url(&dir);
    let instance_a = Storage::new(&url).await.expect("instance a");
    let instance_b = Storage::new(&url).await.expect("instance b");

    let reservation = ReservationId::generate();
    instance_a
        .put_reservation(
            &reservation,
            Reservation {
                blocks: vec![Cell(5), Cell(6), Cell(7)],
                expires_at: None,
            },
        )
        .await
        .expect("put reservation");

    let seen_by_b = instance_b.load_grid().await.expect("load b");
    assert_eq!(seen_by_b.version, 1);
    assert!(seen_by_b.document.locks.contains_key(&reservation));

    // Both read version 1, A commits first.
    let mut from_a: GridDocument = seen_by_b.document.clone();
    from_a.sold.insert(
        Cell(6),
        SoldRecord {
            image_url: "https://img/a.png".into(),
            link_url: "https://a.example".into(),
            name: "a".into(),
            sold_at: 10,
        },
    );
    let mut from_b = seen_by_b.document.clone();
    from_b.sold.insert(
        Cell(6),
        SoldRecord {
            image_url: "https://img/b.png".into(),
            link_url: "https://b.example".into(),
            name: "b".into(),
            sold_at: 11,
        },
    );

    assert_eq!(
        instance_a.save_grid(&from_a, 1).await.expect("save a"),
        SaveOutcome::Saved { version: 2 }
    );
    assert_eq!(
        instance_b.save_grid(&from_b, 1).await.expect("save b"),
        SaveOutcome::Conflict
    );

    let settled = instance_b.load_grid().await.expect("reload");
    assert_eq!(settled.document.sold[&Cell(6)].name, "a");
}
