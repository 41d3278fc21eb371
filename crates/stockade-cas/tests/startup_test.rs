//! Restart behavior: adopting consistent on-disk content, rejecting
//! the rest, and the skip-load reset.

mod common;

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;

use common::{fixture_with_backend, test_blob, CacheFixture};
use stockade_cas::proto;
use stockade_cas::{blob_key, CacheOptions, Digest, FileCache, IndexBackend};

fn populated_fixture() -> (CacheFixture, Digest, Digest, Digest, Digest) {
    let f = fixture_with_backend(10_000, 10_000, true, IndexBackend::Sqlite);

    let a = test_blob(32, 1);
    let digest_a = a.digest.clone();
    f.cache.put(a);

    let x = f.delegate.insert(&test_blob(10, 2).data);
    let y = f.delegate.insert(&test_blob(20, 3).data);
    let root = proto::Directory {
        files: vec![
            proto::FileNode {
                name: "x".to_string(),
                digest: Some(x.to_proto()),
                is_executable: false,
            },
            proto::FileNode {
                name: "y".to_string(),
                digest: Some(y.to_proto()),
                is_executable: true,
            },
        ],
        directories: vec![],
    };
    let root_digest = Digest::of_message(&root);
    let directories = HashMap::from([(root_digest.clone(), root.clone())]);
    f.cache.put_directory(&root_digest, &directories).unwrap();
    f.cache
        .decrement_references(&[], &[root_digest.clone()])
        .unwrap();

    (f, digest_a, x, y, root_digest)
}

fn reopen(f: &CacheFixture) -> FileCache {
    let options = CacheOptions::new(f.env.cache_root.clone(), 10_000, 10_000);
    FileCache::new(options).unwrap()
}

#[test]
fn test_restart_adopts_consistent_content() {
    let (f, digest_a, x, y, root_digest) = populated_fixture();

    let restarted = reopen(&f);
    let results = restarted.start(false).unwrap();

    assert!(!results.load.load_skipped);
    assert_eq!(results.load.scan.file_keys.len(), 3);
    assert_eq!(results.load.scan.compute_dirs.len(), 1);
    assert!(results.load.invalid_directories.is_empty());

    // a, x, y adopted as unreferenced entries; the tree recomputed
    assert_eq!(restarted.entry_count(), 3);
    assert_eq!(restarted.size(), 62);
    assert_eq!(restarted.unreferenced_entry_count(), 3);
    assert_eq!(restarted.directory_storage_count(), 1);
    assert_eq!(
        restarted.directory_entries(&root_digest).unwrap(),
        vec![blob_key(&x, false), blob_key(&y, true)]
    );

    let a = restarted.get(&digest_a).unwrap().unwrap();
    assert_eq!(a.digest, digest_a);
}

#[test]
fn test_restart_rejects_invalid_files() {
    let (f, _, _, _, _) = populated_fixture();
    let root = f.env.cache_root.clone();

    // name that does not parse
    fs::write(root.join("garbage"), b"???").unwrap();
    // valid-looking name whose declared size disagrees
    let bogus = Digest::of_bytes(b"liar");
    fs::write(root.join(blob_key(&bogus, false)), b"12345").unwrap();
    // a _dir that is a plain file
    fs::write(root.join(format!("{}_4_dir", "ab".repeat(32))), b"flat").unwrap();
    // executable suffix without the executable bit
    let plain = test_blob(6, 9);
    let misflagged = root.join(blob_key(&plain.digest, true));
    fs::write(&misflagged, &plain.data).unwrap();
    fs::set_permissions(&misflagged, fs::Permissions::from_mode(0o444)).unwrap();

    let restarted = reopen(&f);
    let results = restarted.start(false).unwrap();

    assert_eq!(results.load.scan.delete_files.len(), 4);
    assert!(!root.join("garbage").exists());
    assert!(!root.join(blob_key(&bogus, false)).exists());
    assert!(!misflagged.exists());
    assert_eq!(restarted.entry_count(), 3);
}

#[test]
fn test_skip_load_resets_root() {
    let (f, digest_a, x, _, root_digest) = populated_fixture();

    let restarted = reopen(&f);
    let results = restarted.start(true).unwrap();

    assert!(results.load.load_skipped);
    assert_eq!(restarted.entry_count(), 0);
    assert_eq!(restarted.size(), 0);
    assert!(f.env.cache_root.exists());
    assert!(!restarted.path(&blob_key(&digest_a, false)).exists());
    assert!(!restarted.path(&blob_key(&x, false)).exists());
    assert!(!restarted.directory_path(&root_digest).exists());
    assert!(restarted.get(&digest_a).unwrap().is_none());
}
