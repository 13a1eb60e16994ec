/*!
 * Integration tests for file systems and the copy engine
 *
 * Two `file://` file systems rooted at different directories stand in for
 * a source and a target on different machines.
 */

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

use xenon::filesystem::{CopyEngine, CopyMode, ListOptions};
use xenon::status::CopyState;
use xenon::{AdaptorRegistry, Credential, FileSystem, XenonError};

async fn rooted(dir: &TempDir) -> Arc<dyn FileSystem> {
    let registry = AdaptorRegistry::builtin().unwrap();
    let uri = format!("file://{}", dir.path().display());
    Arc::from(
        registry
            .create_file_system_from_uri(&uri, &Credential::Default, BTreeMap::new())
            .await
            .unwrap(),
    )
}

#[tokio::test]
async fn test_copy_between_file_systems() {
    let source_dir = TempDir::new().unwrap();
    let target_dir = TempDir::new().unwrap();
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    fs::write(source_dir.path().join("data.bin"), &payload).unwrap();

    let source = rooted(&source_dir).await;
    let target = rooted(&target_dir).await;
    assert_eq!(source.adaptor_name(), "file");

    let engine = CopyEngine::new();
    let id = engine
        .start(
            source.clone(),
            Path::new("/data.bin"),
            target.clone(),
            Path::new("/copy.bin"),
            CopyMode::Create,
        )
        .await
        .unwrap();
    let status = engine.wait_until_done(&id, 10_000).await.unwrap();

    assert!(status.is_done());
    assert_eq!(status.state(), CopyState::Done);
    assert_eq!(status.bytes_to_copy(), Some(payload.len() as u64));
    assert_eq!(status.bytes_copied(), payload.len() as u64);
    assert!(status.maybe_raise().is_ok());
    assert_eq!(fs::read(target_dir.path().join("copy.bin")).unwrap(), payload);
}

#[tokio::test]
async fn test_copy_refuses_existing_target() {
    let source_dir = TempDir::new().unwrap();
    let target_dir = TempDir::new().unwrap();
    fs::write(source_dir.path().join("a.txt"), b"new").unwrap();
    fs::write(target_dir.path().join("a.txt"), b"old").unwrap();

    let source = rooted(&source_dir).await;
    let target = rooted(&target_dir).await;
    let engine = CopyEngine::new();

    let err = engine
        .start(
            source.clone(),
            Path::new("a.txt"),
            target.clone(),
            Path::new("a.txt"),
            CopyMode::Create,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, XenonError::AlreadyExists { .. }));
    assert_eq!(fs::read(target_dir.path().join("a.txt")).unwrap(), b"old");

    let id = engine
        .start(source, Path::new("a.txt"), target, Path::new("a.txt"), CopyMode::Replace)
        .await
        .unwrap();
    engine.wait_until_done(&id, 10_000).await.unwrap();
    assert_eq!(fs::read(target_dir.path().join("a.txt")).unwrap(), b"new");
}

#[tokio::test]
async fn test_list_through_registry() {
    let dir = TempDir::new().unwrap();
    fs::create_dir(dir.path().join("sub")).unwrap();
    fs::write(dir.path().join("top.txt"), b"1").unwrap();
    fs::write(dir.path().join("sub/inner.txt"), b"22").unwrap();
    fs::write(dir.path().join(".hidden"), b"").unwrap();

    let files = rooted(&dir).await;

    let mut shallow: Vec<_> = files
        .list(Path::new("/"), ListOptions::shallow())
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.path)
        .collect();
    shallow.sort();
    assert_eq!(shallow, vec![PathBuf::from("sub"), PathBuf::from("top.txt")]);

    let deep = files.list(Path::new("/"), ListOptions::recursive()).await.unwrap();
    let inner = deep
        .iter()
        .find(|e| e.path == Path::new("sub/inner.txt"))
        .unwrap();
    assert!(inner.is_file());
    assert_eq!(inner.metadata.size, 2);

    files.close().await.unwrap();
    assert!(!files.is_open());
}

#[tokio::test]
async fn test_missing_directory_location_rejected() {
    let registry = AdaptorRegistry::builtin().unwrap();
    let result = registry
        .create_file_system_from_uri(
            "file:///definitely/not/a/real/dir",
            &Credential::Default,
            BTreeMap::new(),
        )
        .await;
    assert!(matches!(
        result.err().unwrap(),
        XenonError::InvalidLocation { .. }
    ));
}
