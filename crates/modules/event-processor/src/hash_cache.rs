use std::{fs::File, io, path::Path};

use moka::sync::Cache;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq)]
struct FileHashInfo {
    last_ctime: i64,
    hash: String,
}

/// Bounded cache of file hashes.
///
/// An entry is trusted only while the file change time matches the one
/// observed when the hash was computed.
pub struct HashCache {
    cache: Cache<String, FileHashInfo>,
}

impl HashCache {
    pub fn new(max_capacity: u64) -> Self {
        Self {
            cache: Cache::new(max_capacity),
        }
    }

    /// Returns the cached hash of `key` if it was computed at `ctime`,
    /// otherwise computes it with `compute` and replaces the entry.
    pub fn get_or_compute<F>(&self, key: &str, ctime: i64, compute: F) -> io::Result<String>
    where
        F: FnOnce() -> io::Result<String>,
    {
        if let Some(info) = self.cache.get(key) {
            if info.last_ctime == ctime {
                return Ok(info.hash);
            }
            log::trace!("{key} changed since last hash ({} != {ctime})", info.last_ctime);
        }
        let hash = compute()?;
        self.cache.insert(
            key.to_string(),
            FileHashInfo {
                last_ctime: ctime,
                hash: hash.clone(),
            },
        );
        Ok(hash)
    }
}

/// Hex encoded sha256 of the content of `path`.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn sha256_of_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(sha256_file(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn reuse_while_ctime_matches() {
        let cache = HashCache::new(16);
        let computed = Cell::new(0);
        let compute = |hash: &str| -> io::Result<String> {
            computed.set(computed.get() + 1);
            Ok(hash.to_string())
        };

        assert_eq!(cache.get_or_compute("1:/bin/ls", 1000, || compute("aaaa")).unwrap(), "aaaa");
        assert_eq!(cache.get_or_compute("1:/bin/ls", 1000, || compute("bbbb")).unwrap(), "aaaa");
        assert_eq!(computed.get(), 1);

        // ctime changed: the old hash must not be reused
        assert_eq!(cache.get_or_compute("1:/bin/ls", 1001, || compute("cccc")).unwrap(), "cccc");
        assert_eq!(cache.get_or_compute("1:/bin/ls", 1001, || compute("dddd")).unwrap(), "cccc");
        assert_eq!(computed.get(), 2);
    }

    #[test]
    fn failures_are_not_cached() {
        let cache = HashCache::new(16);
        let err = cache
            .get_or_compute("1:/bin/ls", 1000, || {
                Err(io::Error::new(io::ErrorKind::NotFound, "gone"))
            })
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert_eq!(
            cache.get_or_compute("1:/bin/ls", 1000, || Ok("aaaa".to_string())).unwrap(),
            "aaaa"
        );
    }
}
