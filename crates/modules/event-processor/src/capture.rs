//! Bookkeeping of captured artifacts and the file copier used to quarantine them.

use std::{
    collections::HashMap,
    fs::{self, File},
    io,
    path::Path,
};

/// Copy the content of the regular file `src` to `dst`.
///
/// Symlinks are followed, but the final target must be a regular file:
/// directories, devices, fifos and sockets are rejected.
/// Mode, ownership and timestamps are not preserved.
pub fn copy_file(src: &Path, dst: &Path) -> io::Result<u64> {
    let metadata = fs::metadata(src)?;
    if !metadata.file_type().is_file() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a regular file", src.display()),
        ));
    }
    let mut source = File::open(src)?;
    let mut destination = File::create(dst)?;
    io::copy(&mut source, &mut destination)
}

/// Last component of an absolute path. The root path is its own base name.
pub fn base_name(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or("/")
}

/// Last known path of every written file, identified by mount namespace,
/// device and inode.
#[derive(Debug, Default)]
pub struct WrittenFiles {
    files: HashMap<String, String>,
}

impl WrittenFiles {
    pub fn key(mnt_id: u32, dev: u32, inode: u64) -> String {
        format!("{mnt_id}/write.dev-{dev}.inode-{inode}")
    }

    /// Index `path` under `key`. Returns false if it was already indexed
    /// with the same path.
    pub fn index(&mut self, key: String, path: &str) -> bool {
        match self.files.get(&key) {
            Some(indexed) if indexed == path => false,
            _ => {
                self.files.insert(key, path.to_string());
                true
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.files.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Change time of every captured file at the moment of its last copy.
#[derive(Debug, Default)]
pub struct CapturedFiles {
    ctimes: HashMap<String, i64>,
}

impl CapturedFiles {
    /// Identifier of a file as seen from a mount namespace.
    pub fn id(mnt_id: u32, source: &Path) -> String {
        format!("{mnt_id}:{}", source.display())
    }

    /// True if `id` was already captured and its change time didn't change since.
    pub fn is_unchanged(&self, id: &str, ctime: i64) -> bool {
        self.ctimes.get(id) == Some(&ctime)
    }

    pub fn mark_captured(&mut self, id: String, ctime: i64) {
        self.ctimes.insert(id, ctime);
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn copy_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::write(&src, b"hello world").unwrap();

        assert_eq!(copy_file(&src, &dst).unwrap(), 11);
        assert_eq!(fs::read(&dst).unwrap(), b"hello world");
    }

    #[test]
    fn copy_follows_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        let link = dir.path().join("link");
        let dst = dir.path().join("dst");
        fs::write(&target, b"content").unwrap();
        std::os::unix::fs::symlink(&target, &link).unwrap();

        copy_file(&link, &dst).unwrap();
        assert_eq!(fs::read(&dst).unwrap(), b"content");
    }

    #[test]
    fn copy_rejects_non_regular_files() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("dst");
        let link = dir.path().join("link_to_dir");
        std::os::unix::fs::symlink(dir.path(), &link).unwrap();

        for src in [dir.path(), link.as_path(), Path::new("/dev/null")] {
            let err = copy_file(src, &dst).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidInput, "{src:?}");
        }
        assert!(!dst.exists());
    }

    #[test]
    fn copy_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let err = copy_file(&dir.path().join("missing"), &dir.path().join("dst")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn base_names() {
        assert_eq!(base_name("/usr/bin/ls"), "ls");
        assert_eq!(base_name("/usr/bin/"), "bin");
        assert_eq!(base_name("/"), "/");
    }

    #[test]
    fn written_files_index() {
        let mut written = WrittenFiles::default();
        let key = WrittenFiles::key(1, 8, 100);
        assert_eq!(key, "1/write.dev-8.inode-100");

        assert!(written.index(key.clone(), "/tmp/a"));
        assert!(!written.index(key.clone(), "/tmp/a"));
        // same inode reached through a different path
        assert!(written.index(key.clone(), "/tmp/b"));
        assert_eq!(written.get(&key), Some("/tmp/b"));
        assert_eq!(written.len(), 1);
    }

    #[test]
    fn captured_files_by_ctime() {
        let mut captured = CapturedFiles::default();
        let id = CapturedFiles::id(7, &PathBuf::from("/proc/1/root/bin/ls"));
        assert_eq!(id, "7:/proc/1/root/bin/ls");

        assert!(!captured.is_unchanged(&id, 1000));
        captured.mark_captured(id.clone(), 1000);
        assert!(captured.is_unchanged(&id, 1000));
        assert!(!captured.is_unchanged(&id, 1001));
    }
}
