use std::{
    collections::{BTreeMap, HashMap},
    fs::File,
    io::{self, BufWriter, Write},
    path::Path,
    sync::{Mutex, PoisonError},
};

use bpf_common::time::Timestamp;
use serde::Serialize;

/// Execution statistics of a captured artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProfileInfo {
    pub times: u64,
    pub first_execution_ts: u64,
}

/// In-memory execution profile: how many times each captured file was
/// executed, and when it was first seen.
#[derive(Debug, Default)]
pub struct ProfileAccumulator {
    files: Mutex<HashMap<String, ProfileInfo>>,
}

impl ProfileAccumulator {
    pub fn update(&self, key: String, execution_ts: Timestamp) {
        let mut files = self.files.lock().unwrap_or_else(PoisonError::into_inner);
        files
            .entry(key)
            .and_modify(|info| info.times += 1)
            .or_insert(ProfileInfo {
                times: 1,
                first_execution_ts: execution_ts.raw(),
            });
    }

    pub fn get(&self, key: &str) -> Option<ProfileInfo> {
        let files = self.files.lock().unwrap_or_else(PoisonError::into_inner);
        files.get(key).copied()
    }

    pub fn snapshot(&self) -> BTreeMap<String, ProfileInfo> {
        let files = self.files.lock().unwrap_or_else(PoisonError::into_inner);
        files.iter().map(|(k, v)| (k.clone(), *v)).collect()
    }

    /// Write the profile to `path` as json.
    pub fn write_profile(&self, path: &Path) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, &self.snapshot())?;
        writer.flush()
    }
}
