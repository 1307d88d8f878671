use std::path::{Path, PathBuf};

use llm_scribe_core::contract::{FileStore, StoreError};
use llm_scribe_core::store::{LocalFileStore, MemoryFileStore};
use tempfile::tempdir;

#[tokio::test]
async fn local_store_round_trips_and_creates_parent_dirs() {
    let tmp = tempdir().unwrap();
    let store = LocalFileStore::new(tmp.path());

    store
        .write(Path::new("inbox/deep/note.md"), "hello")
        .await
        .expect("write should create parents");
    assert!(store.exists(Path::new("inbox/deep/note.md")).await);
    assert!(!store.exists(Path::new("inbox/deep")).await, "directories are not files");
    assert_eq!(store.read(Path::new("inbox/deep/note.md")).await.unwrap(), "hello");
    assert!(store.stat(Path::new("inbox/deep/note.md")).await.is_ok());

    store.delete(Path::new("inbox/deep/note.md")).await.unwrap();
    assert!(!store.exists(Path::new("inbox/deep/note.md")).await);
}

#[tokio::test]
async fn local_store_lists_recursively_sorted_and_skips_hidden_dirs() {
    let tmp = tempdir().unwrap();
    let store = LocalFileStore::new(tmp.path());
    for path in ["inbox/b.md", "inbox/a.md", "inbox/sub/c.md", "inbox/.trash/d.md", "other/e.md"] {
        store.write(Path::new(path), "x").await.unwrap();
    }

    let listed = store.list(Path::new("inbox")).await.unwrap();
    assert_eq!(
        listed,
        vec![
            PathBuf::from("inbox/a.md"),
            PathBuf::from("inbox/b.md"),
            PathBuf::from("inbox/sub/c.md"),
        ]
    );
    assert!(store.list(Path::new("missing")).await.unwrap().is_empty());
}

#[tokio::test]
async fn local_store_reports_not_found_and_rejects_escapes() {
    let tmp = tempdir().unwrap();
    let store = LocalFileStore::new(tmp.path());

    match store.read(Path::new("nope.md")).await {
        Err(StoreError::NotFound(path)) => assert_eq!(path, PathBuf::from("nope.md")),
        other => panic!("expected NotFound, got {other:?}"),
    }
    assert!(store.write(Path::new("../escape.md"), "x").await.is_err());
    assert!(!store.exists(Path::new("../escape.md")).await);
}

#[tokio::test]
async fn memory_store_lists_by_prefix() {
    let store = MemoryFileStore::new();
    store.insert("inbox/a.md", "a");
    store.insert("inboxes/b.md", "b");
    store.insert("c.md", "c");

    assert_eq!(
        store.list(Path::new("inbox")).await.unwrap(),
        vec![PathBuf::from("inbox/a.md")]
    );
    assert_eq!(store.list(Path::new("")).await.unwrap().len(), 3);
    assert!(matches!(
        store.delete(Path::new("zzz.md")).await,
        Err(StoreError::NotFound(_))
    ));
}
