//! Two bindings sharing one local root: one watcher, two handlers, and
//! independent uploads. Reload semantics: duplicates rejected, unchanged
//! handlers keep their queue.

use std::sync::Arc;

use osssync::config::{Config, Setting};
use osssync::store::memory::MemoryStore;
use osssync::store::ObjectStore;
use osssync::syncer::Syncer;
use tempfile::TempDir;

use crate::common::{wait_for, Fixture};

#[tokio::test]
async fn shared_root_fans_out_to_both_handlers() {
    let tempdir = TempDir::new().expect("create temp dir");
    let store_one = Arc::new(MemoryStore::new());
    let store_two = Arc::new(MemoryStore::new());

    let (one, two) = (Arc::clone(&store_one), Arc::clone(&store_two));
    let syncer = Syncer::new(Arc::new(move |setting: &Setting| {
        if setting.bucket == "b1" {
            Arc::clone(&one) as Arc<dyn ObjectStore>
        } else {
            Arc::clone(&two) as Arc<dyn ObjectStore>
        }
    }));

    let local = tempdir.path().to_string_lossy().into_owned();
    let binding = |bucket: &str| Setting {
        name: bucket.to_owned(),
        local: local.clone(),
        endpoint: "https://oss.example.com".to_owned(),
        access_key_id: "id".to_owned(),
        access_key_secret: "secret".to_owned(),
        bucket: bucket.to_owned(),
        prefix: "data".to_owned(),
        ignore_hidden_files: false,
        delete: true,
    };
    syncer
        .reload(Config { settings: vec![binding("b1"), binding("b2")] })
        .await
        .expect("reload");

    std::fs::write(tempdir.path().join("x"), b"shared").expect("write");
    wait_for("both stores to hold x", || {
        store_one.contains("data/x") && store_two.contains("data/x")
    })
    .await;

    syncer.close().await;
}

#[tokio::test]
async fn duplicate_bindings_are_rejected() {
    let fixture = Fixture::idle();
    let setting = fixture.setting("b");
    let config = Config { settings: vec![setting.clone(), setting] };
    assert!(fixture.syncer.reload(config).await.is_err());
    fixture.syncer.close().await;
}

#[tokio::test]
async fn reload_keeps_unchanged_bindings_working() {
    let fixture = Fixture::start(true, false).await;

    fixture.write_file("before.txt", b"1");
    let store = &fixture.store;
    wait_for("first upload", || { store.contains("u/p/before.txt") }).await;

    // Same settings again: the handler is reused, the pipeline stays hot.
    let mut setting = fixture.setting("b");
    setting.delete = true;
    fixture.syncer.reload(Config { settings: vec![setting] }).await.expect("reload");

    fixture.write_file("after.txt", b"2");
    wait_for("upload after reload", || { store.contains("u/p/after.txt") }).await;

    fixture.syncer.close().await;
}
