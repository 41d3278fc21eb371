//! Write-handle behavior: resume, verification failures, limits, and
//! install races.

mod common;

use std::collections::HashMap;
use std::io::Write as IoWrite;
use std::thread;

use common::{fixture, test_blob};
use stockade_cas::proto;
use stockade_cas::{blob_key, CacheError, Digest};
use uuid::Uuid;

#[test]
fn test_zero_size_write_is_trivially_complete() {
    let f = fixture(1000, 1000, false);

    let write = f.cache.get_write(&Digest::empty(), Uuid::new_v4()).unwrap();
    assert!(write.is_complete());
    assert_eq!(write.committed_size(), 0);

    let stream = write.open().unwrap();
    assert!(stream.is_discard());
    stream.commit().unwrap();
    assert_eq!(f.cache.entry_count(), 0);
}

#[test]
fn test_get_write_rejects_oversize_blob() {
    let f = fixture(1000, 16, false);

    let digest = Digest::of_bytes(&test_blob(64, 1).data);
    match f.cache.get_write(&digest, Uuid::new_v4()) {
        Err(CacheError::EntryLimit { size, limit }) => {
            assert_eq!(size, 64);
            assert_eq!(limit, 16);
        }
        other => panic!("expected EntryLimit, got {other:?}"),
    }
}

#[test]
fn test_write_and_read_back() {
    let f = fixture(1000, 1000, false);

    let blob = test_blob(48, 3);
    let write = f.cache.get_write(&blob.digest, Uuid::new_v4()).unwrap();
    let mut stream = write.open().unwrap();
    stream.write_all(&blob.data).unwrap();
    stream.commit().unwrap();

    assert!(write.is_complete());
    assert_eq!(write.committed_size(), 48);
    assert_eq!(f.cache.get(&blob.digest).unwrap().unwrap().data, blob.data);
    assert_eq!(f.cache.unreferenced_entry_count(), 1);
}

#[test]
fn test_interrupted_write_resumes_from_committed_size() {
    let f = fixture(1000, 1000, false);

    let blob = test_blob(64, 5);
    let id = Uuid::new_v4();
    let write = f.cache.get_write(&blob.digest, id).unwrap();

    let mut stream = write.open().unwrap();
    stream.write_all(&blob.data[..24]).unwrap();
    stream.flush().unwrap();
    // connection breaks; the side file stays behind
    drop(stream);
    assert_eq!(write.committed_size(), 24);
    assert!(!write.is_complete());

    // a fresh handle for the same (digest, id) picks up where it left off
    let resumed = f.cache.get_write(&blob.digest, id).unwrap();
    assert_eq!(resumed.committed_size(), 24);
    let mut stream = resumed.open().unwrap();
    stream.write_all(&blob.data[24..]).unwrap();
    stream.commit().unwrap();

    assert_eq!(f.cache.get(&blob.digest).unwrap().unwrap().data, blob.data);
}

#[test]
fn test_digest_mismatch_discards_write() {
    let f = fixture(1000, 1000, false);

    let blob = test_blob(32, 6);
    let write = f.cache.get_write(&blob.digest, Uuid::new_v4()).unwrap();
    let mut stream = write.open().unwrap();
    // right length, wrong bytes
    stream.write_all(&vec![0u8; 32]).unwrap();
    match stream.commit() {
        Err(CacheError::DigestMismatch { expected, actual }) => {
            assert_eq!(expected, blob.digest);
            assert_eq!(actual.size_bytes, 32);
            assert_ne!(actual.hash, expected.hash);
        }
        other => panic!("expected DigestMismatch, got {other:?}"),
    }

    assert_eq!(f.cache.entry_count(), 0);
    assert_eq!(f.cache.size(), 0);
    assert!(!f.cache.path(&blob_key(&blob.digest, false)).exists());
}

#[test]
fn test_short_write_is_incomplete() {
    let f = fixture(1000, 1000, false);

    let blob = test_blob(32, 7);
    let write = f.cache.get_write(&blob.digest, Uuid::new_v4()).unwrap();
    let mut stream = write.open().unwrap();
    stream.write_all(&blob.data[..10]).unwrap();
    match stream.commit() {
        Err(CacheError::IncompleteBlob {
            committed,
            expected,
            ..
        }) => {
            assert_eq!(committed, 10);
            assert_eq!(expected, 32);
        }
        other => panic!("expected IncompleteBlob, got {other:?}"),
    }
    assert_eq!(f.cache.size(), 0);
}

#[test]
fn test_concurrent_identical_puts_install_once() {
    let f = fixture(1000, 1000, false);

    let blob = test_blob(40, 8);
    let digest = blob.digest.clone();
    let threads: Vec<_> = (0..4)
        .map(|_| {
            let cache = f.cache.clone();
            let blob = blob.clone();
            thread::spawn(move || cache.put(blob))
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    assert_eq!(f.cache.entry_count(), 1);
    assert_eq!(f.cache.size(), 40);
    assert_eq!(f.cache.get(&digest).unwrap().unwrap().data, blob.data);
}

#[test]
fn test_put_directory_failure_rolls_back() {
    let f = fixture(1000, 1000, true);

    let present = f.delegate.insert(&test_blob(10, 1).data);
    let missing = Digest::of_bytes(b"never uploaded anywhere");
    let root = proto::Directory {
        files: vec![
            proto::FileNode {
                name: "here".to_string(),
                digest: Some(present.to_proto()),
                is_executable: false,
            },
            proto::FileNode {
                name: "lost".to_string(),
                digest: Some(missing.to_proto()),
                is_executable: false,
            },
        ],
        directories: vec![],
    };
    let root_digest = Digest::of_message(&root);
    let directories = HashMap::from([(root_digest.clone(), root.clone())]);

    match f.cache.put_directory(&root_digest, &directories) {
        Err(CacheError::PutDirectory { digest, causes, .. }) => {
            assert_eq!(digest, root_digest);
            assert_eq!(causes.len(), 1);
        }
        other => panic!("expected PutDirectory, got {other:?}"),
    }

    // no tree, no registration, and the fetched input is unpinned
    assert!(!f.cache.directory_path(&root_digest).exists());
    assert_eq!(f.cache.directory_storage_count(), 0);
    assert!(f.cache.directory_entries(&root_digest).unwrap().is_empty());
    assert_eq!(f.cache.unreferenced_entry_count(), 1);
    assert!(f.cache.contains(&present));
}
