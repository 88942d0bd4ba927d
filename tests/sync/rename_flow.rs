//! A local move surfaces as exactly one remote rename: the old key
//! disappears, the new key holds identical bytes.

use crate::common::{wait_for, Fixture};

#[tokio::test]
async fn local_move_renames_remotely() {
    let fixture = Fixture::start(true, false).await;

    fixture.write_file("a.txt", b"payload");
    let store = &fixture.store;
    wait_for("initial upload", || { store.contains("u/p/a.txt") }).await;
    let puts_after_upload = fixture.store.put_count();

    fixture.create_dir("sub");
    std::fs::rename(fixture.path("a.txt"), fixture.path("sub/a.txt")).expect("move");

    wait_for("renamed key", || {
        store.contains("u/p/sub/a.txt") && !store.contains("u/p/a.txt")
    })
    .await;
    assert_eq!(fixture.store.object("u/p/sub/a.txt").expect("moved object").as_ref(), b"payload");
    // Server-side copy, not a re-upload of the bytes.
    assert_eq!(fixture.store.put_count(), puts_after_upload);

    fixture.syncer.close().await;
}
