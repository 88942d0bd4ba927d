//! Create/overwrite/delete round trip through the full pipeline, with
//! sync status pairs around every non-empty flush.

use osssync::handler::{SyncStatus, SyncStatusEvent};

use crate::common::{wait_for, Fixture};

#[tokio::test]
async fn create_overwrite_delete_round_trip() {
    let fixture = Fixture::start(true, false).await;
    let mut status = fixture.syncer.events().expect("status stream");

    fixture.write_file("a.txt", b"0123456789");
    let store = &fixture.store;
    wait_for("object to appear", || {
        store.object("u/p/a.txt").map(|b| b.len() == 10).unwrap_or(false)
    })
    .await;

    fixture.write_file("a.txt", b"01234");
    wait_for("object to shrink", || {
        store.object("u/p/a.txt").map(|b| b.len() == 5).unwrap_or(false)
    })
    .await;

    std::fs::remove_file(fixture.path("a.txt")).expect("remove local");
    wait_for("object to vanish", || { !store.contains("u/p/a.txt") }).await;

    fixture.syncer.close().await;

    // Every non-empty flush is bracketed by a start/complete pair.
    let mut events: Vec<SyncStatusEvent> = Vec::new();
    while let Ok(event) = status.try_recv() {
        events.push(event);
    }
    assert!(!events.is_empty(), "expected sync status traffic");
    assert_eq!(events.len() % 2, 0, "unpaired status events: {events:?}");
    for pair in events.chunks(2) {
        assert_eq!(pair[0].status, SyncStatus::Start);
        assert_eq!(pair[1].status, SyncStatus::Complete);
        assert_eq!(pair[0].handler, "b/u/p");
    }
}

#[tokio::test]
async fn deletes_stay_local_when_disabled() {
    let fixture = Fixture::start(false, false).await;

    fixture.write_file("keep.txt", b"payload");
    let store = &fixture.store;
    wait_for("object to appear", || { store.contains("u/p/keep.txt") }).await;

    std::fs::remove_file(fixture.path("keep.txt")).expect("remove local");
    // Give the pipeline a few ticks to (wrongly) propagate the delete.
    tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
    assert!(fixture.store.contains("u/p/keep.txt"), "remote delete despite delete=false");

    fixture.syncer.close().await;
}

#[tokio::test]
async fn hidden_files_are_ignored() {
    let fixture = Fixture::start(true, true).await;

    fixture.write_file(".secret", b"hidden");
    fixture.write_file("visible.txt", b"shown");
    let store = &fixture.store;
    wait_for("visible object", || { store.contains("u/p/visible.txt") }).await;
    assert!(!fixture.store.contains("u/p/.secret"), "hidden file was uploaded");

    fixture.syncer.close().await;
}
