use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use bpf_common::{MapError, MapProvider};
use ktrace_core::event::EventId;

/// Tail calls executed on syscall exit, indexed by event id.
pub const SYS_EXIT_TAILS: &str = "sys_exit_tails";

/// Removes an entry from a kernel tail call table, once per process lifetime.
///
/// Concurrent callers race on an atomic flag: the winner performs the
/// deletion, all the others find the table already pruned.
pub struct TailCallPruner {
    maps: Option<Arc<dyn MapProvider>>,
    map_name: &'static str,
    event_id: EventId,
    pruned: AtomicBool,
}

impl TailCallPruner {
    pub fn new(maps: Option<Arc<dyn MapProvider>>, map_name: &'static str, event_id: EventId) -> Self {
        Self {
            maps,
            map_name,
            event_id,
            pruned: AtomicBool::new(false),
        }
    }

    pub fn is_pruned(&self) -> bool {
        self.pruned.load(Ordering::Acquire)
    }

    /// Prune the table if nobody did it yet. Errors are reported to
    /// `on_error` and never retried.
    /// Returns true if this call performed the deletion attempt.
    pub fn prune_once<F>(&self, on_error: F) -> bool
    where
        F: FnOnce(MapError),
    {
        if self
            .pruned
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if let Err(err) = self.prune() {
            on_error(err);
        }
        true
    }

    fn prune(&self) -> Result<(), MapError> {
        let Some(maps) = &self.maps else {
            log::debug!("no kernel maps available, skipping {} pruning", self.map_name);
            return Ok(());
        };
        let map = match maps.get_map(self.map_name) {
            Ok(map) => map,
            Err(MapError::MapNotFound(name)) => {
                log::debug!("{name} not loaded, nothing to prune");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        let key = self.event_id.to_key();
        match map.get_value(&key) {
            Ok(_) => {
                log::debug!("removing {} from {}", self.event_id, self.map_name);
                map.delete_key(&key)
            }
            Err(MapError::KeyNotFound) => Ok(()),
            Err(err) => Err(err),
        }
    }
}
