//! Mounted-view operation contracts, driven against the filesystem core
//! directly: kernel mounting needs /dev/fuse, the semantics do not.

use std::sync::Arc;

use osssync::mount::node::ROOT_INO;
use osssync::mount::vfs::Vfs;
use osssync::remote::RemoteFs;
use osssync::store::memory::MemoryStore;
use tokio_util::sync::CancellationToken;

fn vfs_over(store: &Arc<MemoryStore>, mount_id: &str) -> Vfs {
    let remote = Arc::new(RemoteFs::new(
        Arc::clone(store) as Arc<dyn osssync::store::ObjectStore>,
        "/nonexistent-local-root",
        "u/p",
    ));
    Vfs::new(remote, mount_id, CancellationToken::new())
}

#[tokio::test]
async fn lookup_and_read_serve_remote_bytes() {
    let store = Arc::new(MemoryStore::new());
    store.seed("u/p/hello.txt", &b"hello world"[..]);
    let vfs = vfs_over(&store, "t-read");

    let attr = vfs.lookup(ROOT_INO, "hello.txt").await.expect("lookup");
    assert!(!attr.is_dir);
    assert_eq!(attr.size, 11);

    vfs.open_file(attr.ino).await.expect("open");
    let all = vfs.read(attr.ino, 0, 64).await.expect("read");
    assert_eq!(all.as_ref(), b"hello world");
    let tail = vfs.read(attr.ino, 6, 64).await.expect("ranged read");
    assert_eq!(tail.as_ref(), b"world");

    // Directories refuse reads with EISDIR.
    assert_eq!(vfs.read(ROOT_INO, 0, 16).await.expect_err("dir read"), libc::EISDIR);
    // Missing names are negative lookups.
    assert_eq!(vfs.lookup(ROOT_INO, "absent").await.expect_err("missing"), libc::ENOENT);
}

#[tokio::test]
async fn write_flush_materializes_the_object() {
    let store = Arc::new(MemoryStore::new());
    let vfs = vfs_over(&store, "t-write");

    let attr = vfs.create(ROOT_INO, "new.txt").await.expect("create");
    assert_eq!(attr.size, 0);
    assert!(!store.contains("u/p/new.txt"), "create alone must not touch the store");

    vfs.write(attr.ino, 0, b"hello ").await.expect("write head");
    vfs.write(attr.ino, 6, b"world").await.expect("write tail");
    vfs.flush(attr.ino).await.expect("flush");

    assert_eq!(store.object("u/p/new.txt").expect("object").as_ref(), b"hello world");
    let open = vfs.open_file(attr.ino).await.expect("open after flush");
    assert_eq!(open.size, 11, "size reflects the sum of spilled writes");

    // A second flush with no spill is a no-op.
    vfs.flush(attr.ino).await.expect("idle flush");
}

#[tokio::test]
async fn release_discards_unflushed_writes() {
    let store = Arc::new(MemoryStore::new());
    let vfs = vfs_over(&store, "t-release");

    let attr = vfs.create(ROOT_INO, "aborted.txt").await.expect("create");
    vfs.write(attr.ino, 0, b"doomed").await.expect("write");
    vfs.release(attr.ino).await.expect("release");

    assert!(!store.contains("u/p/aborted.txt"), "released writes must not upload");
}

#[tokio::test]
async fn rename_moves_files_server_side() {
    let store = Arc::new(MemoryStore::new());
    store.seed("u/p/new.txt", &b"hi\n"[..]);
    let vfs = vfs_over(&store, "t-mv");

    vfs.lookup(ROOT_INO, "new.txt").await.expect("lookup");
    vfs.rename(ROOT_INO, "new.txt", ROOT_INO, "renamed.txt").await.expect("rename");

    assert!(!store.contains("u/p/new.txt"));
    assert_eq!(store.object("u/p/renamed.txt").expect("object").as_ref(), b"hi\n");
}

#[tokio::test]
async fn rename_directory_rewrites_descendants() {
    let store = Arc::new(MemoryStore::new());
    store.seed("u/p/dir/a.txt", &b"a"[..]);
    store.seed("u/p/dir/deep/b.txt", &b"b"[..]);
    let vfs = vfs_over(&store, "t-mvdir");

    let dir = vfs.lookup(ROOT_INO, "dir").await.expect("lookup dir");
    assert!(dir.is_dir, "listing under the key makes it a directory");
    // Populate the subtree so descendant nodes exist in the inode table.
    let entries = vfs.readdir(dir.ino).await.expect("readdir");
    let a_ino = entries.iter().find(|e| e.name == "a.txt").expect("a.txt").ino;
    let deep_ino = entries.iter().find(|e| e.name == "deep").expect("deep").ino;
    vfs.readdir(deep_ino).await.expect("readdir deep");

    vfs.rename(ROOT_INO, "dir", ROOT_INO, "moved").await.expect("rename dir");

    assert_eq!(store.keys(), vec!["u/p/moved/a.txt", "u/p/moved/deep/b.txt"]);
    let root_entries = vfs.readdir(ROOT_INO).await.expect("readdir root");
    let names: Vec<&str> = root_entries.iter().map(|e| e.name.as_str()).collect();
    assert!(names.contains(&"moved"));
    assert!(!names.contains(&"dir"));

    // Descendant nodes survive with rewritten keys.
    let bytes = vfs.read(a_ino, 0, 8).await.expect("read through moved node");
    assert_eq!(bytes.as_ref(), b"a");
}

#[tokio::test]
async fn unlink_directory_removes_the_subtree() {
    let store = Arc::new(MemoryStore::new());
    store.seed("u/p/sub/one", &b"1"[..]);
    store.seed("u/p/sub/two", &b"2"[..]);
    store.seed("u/p/keep.txt", &b"k"[..]);
    let vfs = vfs_over(&store, "t-rmr");

    vfs.lookup(ROOT_INO, "sub").await.expect("lookup sub");
    vfs.unlink(ROOT_INO, "sub").await.expect("recursive unlink");

    assert_eq!(store.keys(), vec!["u/p/keep.txt"]);
    assert_eq!(vfs.lookup(ROOT_INO, "sub").await.expect_err("gone"), libc::ENOENT);
}

#[tokio::test]
async fn mkdir_lives_in_memory_until_a_flush() {
    let store = Arc::new(MemoryStore::new());
    let vfs = vfs_over(&store, "t-mkdir");

    let dir = vfs.mkdir(ROOT_INO, "fresh").await.expect("mkdir");
    assert!(dir.is_dir);
    assert!(vfs.readdir(dir.ino).await.expect("readdir").is_empty());
    assert!(store.keys().is_empty(), "mkdir alone creates no objects");

    let file = vfs.create(dir.ino, "inside.txt").await.expect("create");
    vfs.write(file.ino, 0, b"content").await.expect("write");
    vfs.flush(file.ino).await.expect("flush");
    assert_eq!(store.keys(), vec!["u/p/fresh/inside.txt"]);
}

#[tokio::test]
async fn setattr_echoes_without_persisting() {
    let store = Arc::new(MemoryStore::new());
    store.seed("u/p/fixed.txt", &b"12345"[..]);
    let vfs = vfs_over(&store, "t-setattr");

    let attr = vfs.lookup(ROOT_INO, "fixed.txt").await.expect("lookup");
    let echoed = vfs.setattr(attr.ino, Some(99), None).await.expect("setattr");
    assert_eq!(echoed.size, 99);
    // Nothing was persisted: the store and a fresh getattr still agree.
    assert_eq!(store.object("u/p/fixed.txt").expect("object").len(), 5);
    assert_eq!(vfs.getattr(attr.ino).await.expect("getattr").size, 5);
}

#[tokio::test]
async fn statfs_advertises_fixed_capacity() {
    let store = Arc::new(MemoryStore::new());
    let vfs = vfs_over(&store, "t-statfs");
    let capacity = vfs.statfs();
    assert_eq!(capacity.block_size, 4096);
    assert_eq!(capacity.files, 1_000_000_000);
    assert_eq!(capacity.blocks, (1u64 << 50) / 4096);
}
