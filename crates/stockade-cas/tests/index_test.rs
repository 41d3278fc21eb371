//! Behavioral interchangeability of the three directories-index
//! backends: for any operation sequence, the observable multimap state
//! must agree.

use std::collections::HashSet;

use stockade_cas::index::{
    DirectoriesIndex, FileDirectoriesIndex, MemoryDirectoriesIndex, SqliteDirectoriesIndex,
    DIRECTORIES_INDEX_NAME_MEMORY,
};
use stockade_cas::{blob_key, Digest};
use tempfile::TempDir;

struct Backends {
    _roots: Vec<TempDir>,
    backends: Vec<(&'static str, Box<dyn DirectoriesIndex>)>,
}

fn backends() -> Backends {
    let memory_root = TempDir::new().unwrap();
    let file_root = TempDir::new().unwrap();
    let sqlite_root = TempDir::new().unwrap();

    let backends: Vec<(&'static str, Box<dyn DirectoriesIndex>)> = vec![
        ("memory", Box::new(MemoryDirectoriesIndex::new())),
        (
            "file",
            Box::new(FileDirectoriesIndex::new(file_root.path().to_path_buf())),
        ),
        (
            "sqlite",
            Box::new(
                SqliteDirectoriesIndex::new(sqlite_root.path(), DIRECTORIES_INDEX_NAME_MEMORY)
                    .unwrap(),
            ),
        ),
    ];
    for (_, backend) in &backends {
        backend.start().unwrap();
    }
    Backends {
        _roots: vec![memory_root, file_root, sqlite_root],
        backends,
    }
}

fn directory(tag: &str) -> Digest {
    Digest::of_bytes(tag.as_bytes())
}

fn entry(tag: &str) -> String {
    blob_key(&Digest::of_bytes(tag.as_bytes()), false)
}

/// Every observation that distinguishes index states.
fn observe(
    backend: &dyn DirectoriesIndex,
    directories: &[Digest],
) -> Vec<Vec<String>> {
    directories
        .iter()
        .map(|d| backend.directory_entries(d).unwrap())
        .collect()
}

#[test]
fn test_backends_agree_on_operation_sequence() {
    let fixture = backends();
    let d = [directory("d0"), directory("d1"), directory("d2")];
    let e = [entry("e0"), entry("e1"), entry("e2"), entry("e3")];

    // (description, operation) pairs applied to every backend in order
    let ops: Vec<(&str, Box<dyn Fn(&dyn DirectoriesIndex, &[Digest], &[String])>)> = vec![
        (
            "put d0 [e0 e1]",
            Box::new(|ix, d, e| ix.put(&d[0], &[e[0].clone(), e[1].clone()]).unwrap()),
        ),
        (
            "put d1 [e1 e2]",
            Box::new(|ix, d, e| ix.put(&d[1], &[e[1].clone(), e[2].clone()]).unwrap()),
        ),
        (
            "put d2 [e3]",
            Box::new(|ix, d, e| ix.put(&d[2], &[e[3].clone()]).unwrap()),
        ),
        (
            "re-put d0 [e2]",
            Box::new(|ix, d, e| ix.put(&d[0], &[e[2].clone()]).unwrap()),
        ),
        ("remove d1", Box::new(|ix, d, _| ix.remove(&d[1]).unwrap())),
        ("remove d1 again", Box::new(|ix, d, _| ix.remove(&d[1]).unwrap())),
        // d0 was re-put with a different list; removing it strands the
        // pairs from its first put on every backend alike
        ("remove d0", Box::new(|ix, d, _| ix.remove(&d[0]).unwrap())),
    ];

    for (description, op) in &ops {
        let mut states = Vec::new();
        for (name, backend) in &fixture.backends {
            op(backend.as_ref(), &d, &e);
            states.push((name, observe(backend.as_ref(), &d)));
        }
        for window in states.windows(2) {
            assert_eq!(
                window[0].1, window[1].1,
                "backends {} and {} diverge after '{description}'",
                window[0].0, window[1].0
            );
        }
    }

    // remove_entry must report the same containing directories
    for tag in ["e0", "e1", "e2", "e3", "e0"] {
        let key = entry(tag);
        let mut removed: Vec<(&str, HashSet<Digest>)> = Vec::new();
        for (name, backend) in &fixture.backends {
            removed.push((name, backend.remove_entry(&key).unwrap()));
        }
        for window in removed.windows(2) {
            assert_eq!(
                window[0].1, window[1].1,
                "backends {} and {} diverge on remove_entry({tag})",
                window[0].0, window[1].0
            );
        }
    }

    for (_, backend) in &fixture.backends {
        backend.close();
    }
}

#[test]
fn test_remove_entry_returns_every_containing_directory() {
    let fixture = backends();
    let d0 = directory("left");
    let d1 = directory("right");
    let shared = entry("shared");

    for (name, backend) in &fixture.backends {
        backend.put(&d0, &[shared.clone()]).unwrap();
        backend.put(&d1, &[shared.clone()]).unwrap();

        let removed = backend.remove_entry(&shared).unwrap();
        assert_eq!(
            removed,
            HashSet::from([d0.clone(), d1.clone()]),
            "backend {name}"
        );
        assert!(
            backend.remove_entry(&shared).unwrap().is_empty(),
            "backend {name}"
        );
        // forward mappings are not affected by entry removal
        assert_eq!(
            backend.directory_entries(&d0).unwrap(),
            vec![shared.clone()],
            "backend {name}"
        );
    }
}
