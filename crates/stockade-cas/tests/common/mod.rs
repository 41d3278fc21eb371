//! Shared fixtures for cache integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::{Arc, Mutex};

use stockade_cas::{
    Blob, CacheError, CacheOptions, ContentAddressableStorage, Digest, FileCache, IndexBackend,
    Result,
};
use stockade_config::testing::TestEnvironment;

/// In-memory backing store standing in for the remote CAS.
pub struct MemoryCas {
    blobs: Mutex<HashMap<Digest, Vec<u8>>>,
}

impl MemoryCas {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            blobs: Mutex::new(HashMap::new()),
        })
    }

    pub fn insert(&self, data: &[u8]) -> Digest {
        let digest = Digest::of_bytes(data);
        self.blobs
            .lock()
            .unwrap()
            .insert(digest.clone(), data.to_vec());
        digest
    }

    pub fn remove(&self, digest: &Digest) {
        self.blobs.lock().unwrap().remove(digest);
    }

    pub fn blob(&self, digest: &Digest) -> Option<Vec<u8>> {
        self.blobs.lock().unwrap().get(digest).cloned()
    }
}

impl ContentAddressableStorage for MemoryCas {
    fn contains(&self, digest: &Digest) -> bool {
        self.blobs.lock().unwrap().contains_key(digest)
    }

    fn find_missing(&self, digests: &[Digest]) -> Result<Vec<Digest>> {
        let blobs = self.blobs.lock().unwrap();
        Ok(digests
            .iter()
            .filter(|d| !blobs.contains_key(d))
            .cloned()
            .collect())
    }

    fn new_input(&self, digest: &Digest, offset: i64) -> Result<Box<dyn Read + Send>> {
        let blobs = self.blobs.lock().unwrap();
        let data = blobs
            .get(digest)
            .ok_or_else(|| CacheError::NotFound(digest.clone()))?;
        Ok(Box::new(Cursor::new(data[offset as usize..].to_vec())))
    }

    fn ingest(&self, digest: &Digest, source: &mut dyn Read) -> Result<()> {
        let mut data = Vec::new();
        source.read_to_end(&mut data)?;
        let actual = Digest::of_bytes(&data);
        if actual != *digest {
            return Err(CacheError::DigestMismatch {
                expected: digest.clone(),
                actual,
            });
        }
        self.blobs.lock().unwrap().insert(digest.clone(), data);
        Ok(())
    }
}

pub struct CacheFixture {
    pub env: TestEnvironment,
    pub cache: FileCache,
    pub delegate: Arc<MemoryCas>,
    pub expired: Arc<Mutex<Vec<Digest>>>,
}

pub fn fixture(max_size: i64, max_entry_size: i64, with_delegate: bool) -> CacheFixture {
    fixture_with_backend(max_size, max_entry_size, with_delegate, IndexBackend::Memory)
}

pub fn fixture_with_backend(
    max_size: i64,
    max_entry_size: i64,
    with_delegate: bool,
    index_backend: IndexBackend,
) -> CacheFixture {
    stockade_config::logging::init_test_logging();
    let env = TestEnvironment::new().unwrap();
    let delegate = MemoryCas::new();
    let expired = Arc::new(Mutex::new(Vec::new()));

    let mut options = CacheOptions::new(env.cache_root.clone(), max_size, max_entry_size);
    options.index_backend = index_backend;
    if with_delegate {
        options.delegate = Some(delegate.clone() as Arc<dyn ContentAddressableStorage>);
    }
    let expired_sink = expired.clone();
    options.on_expire = Some(Box::new(move |digests: &[Digest]| {
        expired_sink.lock().unwrap().extend(digests.iter().cloned());
    }));

    let cache = FileCache::new(options).unwrap();
    cache.start(false).unwrap();
    CacheFixture {
        env,
        cache,
        delegate,
        expired,
    }
}

/// Deterministic blob content of a given length.
pub fn test_blob(len: usize, seed: u8) -> Blob {
    Blob::new((0..len).map(|i| seed.wrapping_add(i as u8)).collect())
}
