use std::sync::Arc;
use std::time::Duration;

use osssync::config::{Config, Setting};
use osssync::store::memory::MemoryStore;
use osssync::store::ObjectStore;
use osssync::syncer::Syncer;
use tempfile::TempDir;

/// A syncer wired to one in-memory store, watching one temp directory.
pub struct Fixture {
    pub tempdir: TempDir,
    pub store: Arc<MemoryStore>,
    pub syncer: Syncer,
}

impl Fixture {
    /// Build and load a single-binding configuration against a fresh
    /// store.
    pub async fn start(delete: bool, ignore_hidden: bool) -> Self {
        let fixture = Self::idle();
        let mut setting = fixture.setting("b");
        setting.delete = delete;
        setting.ignore_hidden_files = ignore_hidden;
        fixture
            .syncer
            .reload(Config { settings: vec![setting] })
            .await
            .expect("initial reload");
        fixture
    }

    /// A syncer with no bindings loaded yet.
    pub fn idle() -> Self {
        let tempdir = TempDir::new().expect("create temp dir");
        let store = Arc::new(MemoryStore::new());
        let shared = Arc::clone(&store);
        let syncer = Syncer::new(Arc::new(move |_setting: &Setting| {
            Arc::clone(&shared) as Arc<dyn ObjectStore>
        }));
        Self { tempdir, store, syncer }
    }

    /// A binding over this fixture's temp root and store.
    pub fn setting(&self, bucket: &str) -> Setting {
        Setting {
            name: format!("binding-{bucket}"),
            local: self.tempdir.path().to_string_lossy().into_owned(),
            endpoint: "https://oss.example.com".to_owned(),
            access_key_id: "id".to_owned(),
            access_key_secret: "secret".to_owned(),
            bucket: bucket.to_owned(),
            prefix: "u/p".to_owned(),
            ignore_hidden_files: false,
            delete: false,
        }
    }

    pub fn path(&self, name: &str) -> std::path::PathBuf {
        self.tempdir.path().join(name)
    }

    pub fn write_file(&self, name: &str, data: &[u8]) {
        std::fs::write(self.path(name), data).expect("write fixture file");
    }

    pub fn create_dir(&self, name: &str) {
        std::fs::create_dir_all(self.path(name)).expect("create fixture dir");
    }
}

/// Poll `check` until it passes or the timeout lapses.
pub async fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check() {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
