//! Upload semantics of the remote adapter: newer-remote skip and
//! progress reporting.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use osssync::local::LocalFileInfo;
use osssync::progress::{TransferOp, TransferPhase};
use osssync::remote::RemoteFs;
use osssync::store::memory::MemoryStore;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn local_info(path: &std::path::Path) -> LocalFileInfo {
    let meta = std::fs::metadata(path).expect("stat");
    LocalFileInfo::from_metadata(path, &meta)
}

#[tokio::test]
async fn upload_skips_when_remote_is_newer() {
    let tempdir = TempDir::new().expect("tempdir");
    let local = tempdir.path().join("a.txt");
    std::fs::write(&local, b"stale").expect("write");

    let store = Arc::new(MemoryStore::new());
    // Seeding stamps the object with the current time, which is newer
    // than the file written above only if we backdate the local side.
    store.seed("u/p/a.txt", &b"fresh"[..]);
    let remote = RemoteFs::new(Arc::clone(&store) as Arc<dyn osssync::store::ObjectStore>, tempdir.path(), "u/p");
    let cancel = CancellationToken::new();

    let mut info = local_info(&local);
    info.mod_time = SystemTime::now() - Duration::from_secs(60);
    remote.upload_file(&info, &cancel).await.expect("upload resolves");

    assert_eq!(store.put_count(), 0, "upload must skip a newer remote");
    assert_eq!(store.object("u/p/a.txt").expect("object").as_ref(), b"fresh");

    // A local write newer than the remote does go out.
    info.mod_time = SystemTime::now() + Duration::from_secs(60);
    remote.upload_file(&info, &cancel).await.expect("upload");
    assert_eq!(store.put_count(), 1);
    assert_eq!(store.object("u/p/a.txt").expect("object").as_ref(), b"stale");
}

#[tokio::test]
async fn streamed_bytes_round_trip_with_conditional_open() {
    let tempdir = TempDir::new().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let remote = RemoteFs::new(Arc::clone(&store) as Arc<dyn osssync::store::ObjectStore>, tempdir.path(), "u/p");
    let cancel = CancellationToken::new();

    let key = remote.add_prefix("notes/today.md");
    assert_eq!(key, "u/p/notes/today.md");
    remote
        .upload_bytes(&key, bytes::Bytes::from_static(b"# notes\n"), &cancel)
        .await
        .expect("upload");

    let body = remote.read_all(&key, &cancel).await.expect("read back");
    assert_eq!(body.as_ref(), b"# notes\n");

    let meta = remote.open(&key, &cancel).await.expect("head");
    let etag = meta.etag.expect("etag");
    let unchanged = remote.open_if_changed(&key, &etag, &cancel).await;
    assert!(unchanged.expect_err("etag matches").is_not_modified());
    assert_eq!(remote.strip_prefix(&key), "notes/today.md");

    let downloaded = remote.download(&key, tempdir.path(), &cancel).await.expect("download");
    assert_eq!(std::fs::read(&downloaded).expect("local copy"), b"# notes\n");
}

#[tokio::test]
async fn remove_reports_completed_and_failed_keys() {
    let store = Arc::new(MemoryStore::new());
    store.seed("u/p/present.txt", &b"x"[..]);
    let remote = RemoteFs::new(Arc::clone(&store) as Arc<dyn osssync::store::ObjectStore>, "/tmp/none", "u/p");
    let events = remote.events();
    let cancel = CancellationToken::new();

    let deleted = remote
        .remove(&["u/p/present.txt".to_owned(), "u/p/missing.txt".to_owned()], &cancel)
        .await
        .expect("remove");
    assert_eq!(deleted, vec!["u/p/present.txt".to_owned()]);

    let first = events.recv().await.expect("first event");
    assert_eq!(first.op, TransferOp::Remove);
    assert_eq!(first.phase, TransferPhase::Completed);
    assert_eq!(first.src, "u/p/present.txt");

    let second = events.recv().await.expect("second event");
    assert_eq!(second.phase, TransferPhase::Failed);
    assert_eq!(second.src, "u/p/missing.txt");
}

#[tokio::test]
async fn upload_reports_lifecycle_progress() {
    let tempdir = TempDir::new().expect("tempdir");
    let local = tempdir.path().join("b.txt");
    std::fs::write(&local, b"0123456789").expect("write");

    let store = Arc::new(MemoryStore::new());
    let remote = RemoteFs::new(store, tempdir.path(), "u/p");
    let events = remote.events();
    let cancel = CancellationToken::new();

    remote.upload_file(&local_info(&local), &cancel).await.expect("upload");

    let started = events.recv().await.expect("started");
    assert_eq!(started.phase, TransferPhase::Started);
    assert_eq!(started.op, TransferOp::Upload);
    assert_eq!(started.total_bytes, 10);
    assert_eq!(started.dst, "u/p/b.txt");

    let completed = events.recv().await.expect("completed");
    assert_eq!(completed.phase, TransferPhase::Completed);
    assert_eq!(completed.consumed_bytes, 10);
}
