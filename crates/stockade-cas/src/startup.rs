//! Startup rescan of a pre-existing cache root.
//!
//! Three phases. Scan classifies every root dirent in parallel: blob
//! files whose names round-trip and whose on-disk size and executable
//! bit agree are adopted as unreferenced entries; everything else is
//! marked for deletion. Compute walks each surviving `_dir` tree in
//! sorted dirent order, joins the files back to adopted entries by
//! inode, and keeps the tree only if the reconstructed directory
//! message digests to the tree's own name. Delete removes the
//! casualties.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rayon::prelude::*;
use tracing::{error, info};

use crate::digest::Digest;
use crate::entry::EXISTS_WINDOW;
use crate::fsutil::{is_read_only_executable, list_dirent_sorted, remove_tree, FileKey};
use crate::key::{directory_name, key_to_digest, parse_file_entry_key};
use crate::proto;
use crate::error::Result;
use crate::{DirectoryEntry, FileCache};

/// Outcome of `FileCache::start`.
#[derive(Debug)]
pub struct StartupCacheResults {
    pub cache_directory: PathBuf,
    pub load: CacheLoadResults,
    pub startup_time: Duration,
}

#[derive(Debug, Default)]
pub struct CacheLoadResults {
    pub load_skipped: bool,
    pub scan: CacheScanResults,
    pub invalid_directories: Vec<PathBuf>,
}

#[derive(Debug, Default)]
pub struct CacheScanResults {
    pub compute_dirs: Vec<PathBuf>,
    pub delete_files: Vec<PathBuf>,
    pub file_keys: HashMap<FileKey, String>,
}

impl FileCache {
    /// Initialize the cache root, adopting any consistent content
    /// already present. With `skip_load` the root is deleted and
    /// recreated empty instead.
    pub fn start(&self, skip_load: bool) -> Result<StartupCacheResults> {
        let root = self.root().to_path_buf();
        info!("initializing cache at {}", root.display());
        let start_time = Instant::now();

        let load = if skip_load {
            remove_tree(&root)?;
            fs::create_dir_all(&root)?;
            CacheLoadResults {
                load_skipped: true,
                ..Default::default()
            }
        } else {
            fs::create_dir_all(&root)?;
            self.load_cache()?
        };

        info!("creating index");
        self.inner.directories_index.start()?;

        let startup_time = start_time.elapsed();
        info!("startup time: {}ms", startup_time.as_millis());
        Ok(StartupCacheResults {
            cache_directory: root,
            load,
            startup_time,
        })
    }

    fn load_cache(&self) -> Result<CacheLoadResults> {
        let scan = self.scan_root()?;
        info!(
            dirs = scan.compute_dirs.len(),
            keys = scan.file_keys.len(),
            delete = scan.delete_files.len(),
            "cache root scanned"
        );
        self.delete_invalid_content(&scan.delete_files);

        let invalid_directories = self.compute_directories(&scan);
        info!(invalid_dirs = invalid_directories.len(), "directories computed");
        self.delete_invalid_content(&invalid_directories);

        Ok(CacheLoadResults {
            load_skipped: false,
            scan,
            invalid_directories,
        })
    }

    fn scan_root(&self) -> Result<CacheScanResults> {
        let mut dirents = Vec::new();
        for dirent in fs::read_dir(self.root())? {
            dirents.push(dirent?.path());
        }

        let scan = Mutex::new(CacheScanResults::default());
        let adopted = Mutex::new(Vec::new());
        dirents.par_iter().for_each(|path| {
            if let Err(e) = self.process_root_file(path, &scan, &adopted) {
                error!("error reading file {}: {e}", path.display());
            }
        });

        let adopted = adopted.into_inner().unwrap();
        (self.inner.on_put_all)(&adopted);
        Ok(scan.into_inner().unwrap())
    }

    fn process_root_file(
        &self,
        path: &Path,
        scan: &Mutex<CacheScanResults>,
        adopted: &Mutex<Vec<Digest>>,
    ) -> Result<()> {
        let Some(basename) = path.file_name().and_then(|n| n.to_str()) else {
            scan.lock().unwrap().delete_files.push(path.to_path_buf());
            return Ok(());
        };

        // the index database is rebuilt for every start
        if basename == self.inner.index_db_name {
            return Ok(());
        }

        let metadata = fs::symlink_metadata(path)?;
        if basename.ends_with("_dir") {
            if metadata.is_dir() {
                scan.lock().unwrap().compute_dirs.push(path.to_path_buf());
            } else {
                scan.lock().unwrap().delete_files.push(path.to_path_buf());
            }
            return Ok(());
        }
        if metadata.is_dir() {
            scan.lock().unwrap().delete_files.push(path.to_path_buf());
            return Ok(());
        }

        let size = metadata.len() as i64;
        let entry_key = parse_file_entry_key(basename).filter(|k| k.size == size);
        let valid = match &entry_key {
            Some(k) => {
                size > 0
                    && size <= self.inner.max_entry_size_in_bytes
                    && is_read_only_executable(&metadata) == k.executable
            }
            None => false,
        };
        if !valid {
            scan.lock().unwrap().delete_files.push(path.to_path_buf());
            return Ok(());
        }
        let entry_key = entry_key.unwrap();

        // budget admission and adoption are atomic under the monitor
        let admitted = {
            let mut state = self.inner.state.lock().unwrap();
            if state.size_in_bytes + size > self.inner.max_size_in_bytes {
                false
            } else {
                let id = state.lru.insert(entry_key.key.clone(), size);
                if state.lru.decrement_reference(id) {
                    state.unreferenced_count += 1;
                }
                state.storage.insert(entry_key.key.clone(), id);
                state.size_in_bytes += size;
                true
            }
        };
        if !admitted {
            scan.lock().unwrap().delete_files.push(path.to_path_buf());
            return Ok(());
        }

        scan.lock()
            .unwrap()
            .file_keys
            .insert(FileKey::of(&metadata), entry_key.key);
        adopted.lock().unwrap().push(entry_key.digest);
        Ok(())
    }

    fn compute_directories(&self, scan: &CacheScanResults) -> Vec<PathBuf> {
        let invalid = Mutex::new(Vec::new());
        scan.compute_dirs.par_iter().for_each(|path| {
            match self.adopt_directory(path, &scan.file_keys) {
                Ok(true) => {}
                Ok(false) => invalid.lock().unwrap().push(path.clone()),
                Err(e) => {
                    error!("error reading directory {}: {e}", path.display());
                    invalid.lock().unwrap().push(path.clone());
                }
            }
        });
        invalid.into_inner().unwrap()
    }

    /// Rebuild the directory message for a materialized tree and adopt
    /// it iff its digest matches the tree's name.
    fn adopt_directory(&self, path: &Path, file_keys: &HashMap<FileKey, String>) -> Result<bool> {
        let mut inputs = Vec::new();
        let Some(directory) = self.compute_directory(path, file_keys, &mut inputs)? else {
            return Ok(false);
        };
        let digest = Digest::of_message(&directory);
        if self.path(&directory_name(&digest)) != path {
            return Ok(false);
        }

        self.inner.directories_index.put(&digest, &inputs)?;
        let mut state = self.inner.state.lock().unwrap();
        state.directories.insert(
            digest,
            DirectoryEntry {
                directory,
                exists_deadline: Instant::now() + EXISTS_WINDOW,
            },
        );
        Ok(true)
    }

    fn compute_directory(
        &self,
        path: &Path,
        file_keys: &HashMap<FileKey, String>,
        inputs: &mut Vec<String>,
    ) -> Result<Option<proto::Directory>> {
        let mut directory = proto::Directory::default();
        for (name, metadata) in list_dirent_sorted(path)? {
            let Some(name) = name.to_str().map(str::to_string) else {
                return Ok(None);
            };
            let entry_path = path.join(&name);

            if let Some(key) = file_keys.get(&FileKey::of(&metadata)) {
                inputs.push(key.clone());
                let digest = key_to_digest(key)?;
                directory.files.push(proto::FileNode {
                    name,
                    digest: Some(digest.to_proto()),
                    is_executable: key.ends_with("_exec"),
                });
            } else if metadata.is_dir() {
                match self.compute_directory(&entry_path, file_keys, inputs)? {
                    Some(child) => directory.directories.push(proto::DirectoryNode {
                        name,
                        digest: Some(Digest::of_message(&child).to_proto()),
                    }),
                    None => return Ok(None),
                }
            } else if metadata.len() == 0 {
                directory.files.push(proto::FileNode {
                    name,
                    digest: Some(Digest::empty().to_proto()),
                    is_executable: is_read_only_executable(&metadata),
                });
            } else {
                // a non-empty file with no adopted entry; the tree
                // cannot have come from the cache
                return Ok(None);
            }
        }
        Ok(Some(directory))
    }

    fn delete_invalid_content(&self, paths: &[PathBuf]) {
        for path in paths {
            let result = if path.is_dir() {
                remove_tree(path)
            } else {
                fs::remove_file(path)
            };
            if let Err(e) = result {
                error!("failure to delete cache content {}: {e}", path.display());
            }
        }
    }
}
