//! Recently seen processes per mount namespace.
//!
//! When an exec event is processed, the process which generated it might have
//! already exited. To still reach the executed file we go through the root
//! filesystem of another process living in the same mount namespace, so we
//! remember a few pids for each namespace.

use std::collections::HashMap;

use bpf_common::Pid;

/// Bounded pid buckets indexed by mount namespace id.
///
/// Ordinary insertions are deduplicated and, once a bucket is full, evict the
/// oldest ordinary pid. A forced insertion pins its pid in the first slot of
/// the bucket: it's reserved for the init process of the namespace, which
/// lives as long as the namespace itself.
#[derive(Debug)]
pub struct MntNsPids {
    bucket_size: usize,
    buckets: HashMap<u32, PidBucket>,
}

#[derive(Debug, Default)]
struct PidBucket {
    pids: Vec<Pid>,
    /// If true, pids[0] was force-inserted and is never evicted
    pinned: bool,
}

impl MntNsPids {
    pub fn new(bucket_size: usize) -> Self {
        Self {
            bucket_size: bucket_size.max(1),
            buckets: HashMap::new(),
        }
    }

    /// Remember `pid` in the bucket of `mnt_id`, evicting the oldest
    /// ordinary pid if the bucket is full.
    pub fn add(&mut self, mnt_id: u32, pid: Pid) {
        let bucket = self.buckets.entry(mnt_id).or_default();
        if bucket.pids.contains(&pid) {
            return;
        }
        if bucket.pids.len() >= self.bucket_size {
            let oldest = usize::from(bucket.pinned);
            if oldest >= bucket.pids.len() {
                // the only slot is taken by the pinned pid
                return;
            }
            let evicted = bucket.pids.remove(oldest);
            log::trace!("evicting {evicted} from mount namespace {mnt_id}");
        }
        bucket.pids.push(pid);
    }

    /// Pin `pid` as the first candidate of `mnt_id`.
    pub fn force_add(&mut self, mnt_id: u32, pid: Pid) {
        let bucket = self.buckets.entry(mnt_id).or_default();
        if bucket.pinned {
            // a new init process replaces the previous one
            bucket.pids.remove(0);
        }
        bucket.pids.retain(|p| *p != pid);
        bucket.pids.insert(0, pid);
        bucket.pinned = true;
        if bucket.pids.len() > self.bucket_size {
            bucket.pids.remove(1);
        }
    }

    /// Candidates for resolving paths inside `mnt_id`, pinned pid first.
    pub fn get_bucket(&self, mnt_id: u32) -> Vec<Pid> {
        self.buckets
            .get(&mnt_id)
            .map(|bucket| bucket.pids.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MNT_NS: u32 = 4026531841;

    fn pids(raw: &[i32]) -> Vec<Pid> {
        raw.iter().copied().map(Pid::from_raw).collect()
    }

    #[test]
    fn unknown_namespace_is_empty() {
        assert!(MntNsPids::new(5).get_bucket(MNT_NS).is_empty());
    }

    #[test]
    fn deduplicates() {
        let mut index = MntNsPids::new(5);
        index.add(MNT_NS, Pid::from_raw(10));
        index.add(MNT_NS, Pid::from_raw(10));
        index.add(MNT_NS + 1, Pid::from_raw(10));
        assert_eq!(index.get_bucket(MNT_NS), pids(&[10]));
        assert_eq!(index.get_bucket(MNT_NS + 1), pids(&[10]));
    }

    #[test]
    fn evicts_oldest() {
        let mut index = MntNsPids::new(3);
        for pid in 10..15 {
            index.add(MNT_NS, Pid::from_raw(pid));
        }
        assert_eq!(index.get_bucket(MNT_NS), pids(&[12, 13, 14]));
    }

    #[test]
    fn pinned_pid_survives_churn() {
        let mut index = MntNsPids::new(3);
        index.add(MNT_NS, Pid::from_raw(10));
        index.force_add(MNT_NS, Pid::from_raw(300));
        for pid in 11..100 {
            index.add(MNT_NS, Pid::from_raw(pid));
            let bucket = index.get_bucket(MNT_NS);
            assert_eq!(bucket[0], Pid::from_raw(300));
            assert!(bucket.len() <= 3);
        }
        assert_eq!(index.get_bucket(MNT_NS), pids(&[300, 98, 99]));
    }

    #[test]
    fn force_add_in_full_bucket() {
        let mut index = MntNsPids::new(3);
        for pid in [10, 11, 12] {
            index.add(MNT_NS, Pid::from_raw(pid));
        }
        index.force_add(MNT_NS, Pid::from_raw(300));
        assert_eq!(index.get_bucket(MNT_NS), pids(&[300, 11, 12]));

        // a new init replaces the pinned one
        index.force_add(MNT_NS, Pid::from_raw(400));
        assert_eq!(index.get_bucket(MNT_NS), pids(&[400, 11, 12]));
    }

    #[test]
    fn force_add_of_known_pid() {
        let mut index = MntNsPids::new(3);
        for pid in [10, 11, 12] {
            index.add(MNT_NS, Pid::from_raw(pid));
        }
        index.force_add(MNT_NS, Pid::from_raw(12));
        assert_eq!(index.get_bucket(MNT_NS), pids(&[12, 10, 11]));
        index.force_add(MNT_NS, Pid::from_raw(12));
        assert_eq!(index.get_bucket(MNT_NS), pids(&[12, 10, 11]));
    }
}
