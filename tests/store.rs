use std::fs;
use std::sync::Arc;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};

use kira_pipeline::domain::{Compression, FileRef};
use kira_pipeline::error::PipelineError;
use kira_pipeline::gateway::StorageGateway;
use kira_pipeline::store::{FsObjectStore, ObjectStore};

fn setup() -> (tempfile::TempDir, Utf8PathBuf, Arc<FsObjectStore>, StorageGateway) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let store = Arc::new(FsObjectStore::new(root.join("remote")));
    let gateway = StorageGateway::new(store.clone());
    (temp, root, store, gateway)
}

fn local_file(root: &Utf8Path, name: &str, content: &[u8]) -> Utf8PathBuf {
    let dir = root.join("local");
    fs::create_dir_all(dir.as_std_path()).unwrap();
    let path = dir.join(name);
    fs::write(path.as_std_path(), content).unwrap();
    path
}

#[test]
fn object_store_is_write_once() {
    let (_temp, _root, store, _gateway) = setup();
    let path = Utf8Path::new("data/a.pcl.1.none");

    store.put(path, b"first").unwrap();
    assert_eq!(store.stat(path).unwrap(), Some(5));
    assert_matches!(store.put(path, b"second"), Err(PipelineError::Transfer { .. }));
    assert_eq!(store.get(path).unwrap(), b"first");

    store.delete(path).unwrap();
    assert_eq!(store.stat(path).unwrap(), None);
    store.delete(path).unwrap();
}

#[test]
fn publish_then_fetch_gz() {
    let (_temp, root, _store, gateway) = setup();
    let local = local_file(&root, "a.pcl", b"gene\t1\n");

    let published = gateway
        .publish(&local, Utf8Path::new("data/geo"), 100, Compression::Gz)
        .unwrap();
    assert_eq!(published.path().as_str(), "data/geo/a.pcl.100.gz");

    let fetched = gateway.fetch(&published, &root.join("staged")).unwrap();
    assert_eq!(fetched.local, root.join("staged/a.pcl"));
    assert_eq!(fetched.bytes, 7);
    assert_eq!(fs::read(fetched.local.as_std_path()).unwrap(), b"gene\t1\n");
}

#[test]
fn publish_is_idempotent_for_same_content() {
    let (_temp, root, _store, gateway) = setup();
    let local = local_file(&root, "a.pcl", b"abc");
    let dir = Utf8Path::new("data/geo");

    let first = gateway.publish(&local, dir, 100, Compression::Gz).unwrap();
    let second = gateway.publish(&local, dir, 100, Compression::Gz).unwrap();
    assert_eq!(first, second);

    fs::write(local.as_std_path(), b"changed").unwrap();
    assert_matches!(
        gateway.publish(&local, dir, 100, Compression::Gz),
        Err(PipelineError::Transfer { .. })
    );
    assert!(gateway.publish(&local, dir, 101, Compression::Gz).is_ok());
}

#[test]
fn fetch_reports_missing_and_empty_objects() {
    let (_temp, root, store, gateway) = setup();
    let missing: FileRef = "data/geo/missing.pcl.1.none".parse().unwrap();
    assert_matches!(
        gateway.fetch(&missing, &root.join("staged")),
        Err(PipelineError::Transfer { .. })
    );
    assert_matches!(gateway.size(&missing), Err(PipelineError::Transfer { .. }));
    assert!(!gateway.exists(&missing).unwrap());

    let empty: FileRef = "data/geo/empty.pcl.1.none".parse().unwrap();
    store.put(empty.path(), b"").unwrap();
    let fetched = gateway.fetch(&empty, &root.join("staged")).unwrap();
    assert!(fetched.is_empty());
}

#[test]
fn listing_picks_versions() {
    let (_temp, _root, store, gateway) = setup();
    for name in [
        "data/geo/a.pcl.100.none",
        "data/geo/a.pcl.200.none",
        "data/geo/b.pcl.100.gz",
        "data/geo/notes.txt",
        "data/geo/nested/c.pcl.300.none",
    ] {
        store.put(Utf8Path::new(name), b"x").unwrap();
    }
    let dir = Utf8Path::new("data/geo");

    assert_eq!(gateway.list(dir).unwrap().len(), 3);
    let at_100: Vec<String> = gateway
        .list_at(dir, 100)
        .unwrap()
        .iter()
        .map(ToString::to_string)
        .collect();
    assert_eq!(at_100, vec!["data/geo/a.pcl.100.none", "data/geo/b.pcl.100.gz"]);

    let newest = gateway.list_newest(dir).unwrap();
    assert_eq!(newest.len(), 2);
    assert_eq!(newest[0].timestamp(), 200);

    assert_eq!(gateway.remove_prefix(dir).unwrap(), 5);
    assert!(store.list(dir).unwrap().is_empty());
}

#[test]
fn meta_bundle_round_trip() {
    let (_temp, root, _store, gateway) = setup();
    let meta = root.join("meta");
    let tmp = root.join("tmp");
    fs::create_dir_all(meta.as_std_path()).unwrap();
    fs::create_dir_all(tmp.as_std_path()).unwrap();
    let remote_meta = Utf8Path::new("meta/geo/000-discover");

    assert!(gateway.fetch_meta(remote_meta, 100, &meta, &tmp).unwrap().is_none());
    assert!(gateway.publish_meta(&meta, remote_meta, 100, &tmp).unwrap().is_none());

    fs::write(meta.join("seen.txt").as_std_path(), b"GSE1").unwrap();
    let bundle = gateway
        .publish_meta(&meta, remote_meta, 100, &tmp)
        .unwrap()
        .unwrap();
    assert_eq!(bundle.name(), "meta.zip");

    let restored = root.join("restored");
    fs::create_dir_all(restored.as_std_path()).unwrap();
    assert!(gateway.fetch_meta(remote_meta, 100, &restored, &tmp).unwrap().is_none());
    assert!(!restored.join("seen.txt").as_std_path().exists());

    let fetched = gateway.fetch_meta(remote_meta, 101, &restored, &tmp).unwrap();
    assert_eq!(fetched, Some(bundle));
    assert_eq!(fs::read(restored.join("seen.txt").as_std_path()).unwrap(), b"GSE1");
}

#[test]
fn meta_bundle_is_newest_before_run() {
    let (_temp, root, store, gateway) = setup();
    let meta = root.join("meta");
    let tmp = root.join("tmp");
    fs::create_dir_all(tmp.as_std_path()).unwrap();
    let remote_meta = Utf8Path::new("meta/geo/000-discover");

    for (timestamp, content) in [(100, "first"), (200, "second"), (300, "third")] {
        let source = root.join(format!("bundle-{timestamp}"));
        fs::create_dir_all(source.as_std_path()).unwrap();
        fs::write(source.join("state.txt").as_std_path(), content).unwrap();
        gateway
            .publish_meta(&source, remote_meta, timestamp, &tmp)
            .unwrap();
    }
    assert_eq!(store.list(remote_meta).unwrap().len(), 3);

    let fetched = gateway.fetch_meta(remote_meta, 300, &meta, &tmp).unwrap().unwrap();
    assert_eq!(fetched.timestamp(), 200);
    assert_eq!(fs::read_to_string(meta.join("state.txt").as_std_path()).unwrap(), "second");
}
