//! # Event processor
//!
//! User-space processing of decoded kernel events. Every event goes through:
//! 1. [`EventProcessor::should_process`]: drop uninteresting events as early as possible
//! 2. [`EventProcessor::process`]: event-specific enrichment and side effects:
//!    - `vfs_write`/`vfs_writev`: index written files
//!    - `sched_process_exec`: track pids per mount namespace, quarantine the
//!      executed file, keep an execution profile and add its sha256 to the event
//!    - `socket`: prune the socket tail call, which is needed only until the first
//!      socket event is seen
//!
//! All the indexes live for the whole tracing session. Each of them has its own
//! lock and no operation holds more than one at a time, so a single
//! [`EventProcessor`] can be shared by concurrent event readers.

use std::{
    fs::DirBuilder,
    io,
    os::unix::fs::DirBuilderExt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bpf_common::{MapProvider, Pid, parsing::procfs};
use ktrace_core::{
    event::{ArgError, ArgMeta, Args, EventContext, EventId, get_arg},
    stats::Stats,
};
use thiserror::Error;

pub mod capture;
pub mod config;
pub mod filtering;
pub mod hash_cache;
pub mod lost_events;
pub mod mntns;
pub mod profile;
pub mod tail_call;

pub use config::Config;
pub use lost_events::start_lost_events_drain;

use capture::{CapturedFiles, WrittenFiles, base_name, copy_file};
use hash_cache::{HashCache, sha256_file};
use mntns::MntNsPids;
use profile::ProfileAccumulator;
use tail_call::{SYS_EXIT_TAILS, TailCallPruner};

pub const MODULE_NAME: &str = "event-processor";

/// Name of the argument added to exec events when hashing is enabled.
pub const HASH_ARG_NAME: &str = "sha256";
const HASH_ARG_TYPE: &str = "const char*";

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("error parsing {event} args")]
    InvalidArgs {
        event: EventId,
        #[source]
        source: ArgError,
    },
    #[error("no process found in mount namespace {mnt_id} to access {path}")]
    NoProcessInNamespace { mnt_id: u32, path: String },
    #[error(transparent)]
    Resolve(#[from] procfs::ProcfsError),
    #[error("creating capture directory {path:?}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("capturing {src:?} to {dst:?}")]
    Capture {
        src: PathBuf,
        dst: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("hashing {path:?}")]
    Hash {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub struct EventProcessor {
    config: Config,
    stats: Arc<Stats>,
    written_files: Mutex<WrittenFiles>,
    captured_files: Mutex<CapturedFiles>,
    mntns_pids: Mutex<MntNsPids>,
    hash_cache: HashCache,
    profile: ProfileAccumulator,
    socket_tail: TailCallPruner,
}

impl EventProcessor {
    /// `maps` gives access to the loaded eBPF object; without it, kernel
    /// tables are left untouched.
    pub fn new(config: Config, stats: Arc<Stats>, maps: Option<Arc<dyn MapProvider>>) -> Self {
        Self {
            written_files: Mutex::new(WrittenFiles::default()),
            captured_files: Mutex::new(CapturedFiles::default()),
            mntns_pids: Mutex::new(MntNsPids::new(config.pid_bucket_size)),
            hash_cache: HashCache::new(config.hash_cache_size),
            profile: ProfileAccumulator::default(),
            socket_tail: TailCallPruner::new(maps, SYS_EXIT_TAILS, EventId::SOCKET),
            stats,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn profile(&self) -> &ProfileAccumulator {
        &self.profile
    }

    /// Full processing of an event coming from the decoder.
    /// Returns true if the event should be forwarded to the consumers.
    pub fn handle(
        &self,
        ctx: &mut EventContext,
        args: &mut Args,
        arg_metas: &mut Vec<ArgMeta>,
    ) -> bool {
        self.stats.add_event();
        if !self.should_process(ctx, args) {
            return false;
        }
        if let Err(err) = self.process(ctx, args, arg_metas) {
            self.handle_error(err);
            return false;
        }
        true
    }

    /// Decides whether or not to drop an event before further processing it.
    pub fn should_process(&self, ctx: &EventContext, args: &Args) -> bool {
        self.config.filters.should_process(ctx, args)
    }

    pub fn process(
        &self,
        ctx: &mut EventContext,
        args: &mut Args,
        arg_metas: &mut Vec<ArgMeta>,
    ) -> Result<(), ProcessError> {
        match ctx.event_id {
            EventId::VFS_WRITE | EventId::VFS_WRITEV => self.on_write(ctx, args),
            EventId::SCHED_PROCESS_EXEC => self.on_exec(ctx, args, arg_metas),
            EventId::SOCKET => {
                self.socket_tail
                    .prune_once(|err| self.handle_error(err));
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Errors which don't stop the tracing session are logged and counted.
    pub fn handle_error<E: std::error::Error + Send + Sync + 'static>(&self, err: E) {
        self.stats.add_error();
        bpf_common::log_error("error processing event", err);
    }

    fn on_write(&self, ctx: &EventContext, args: &Args) -> Result<(), ProcessError> {
        if !self.config.capture_write {
            return Ok(());
        }
        let invalid_args = |source| ProcessError::InvalidArgs {
            event: ctx.event_id,
            source,
        };
        let path: &str = get_arg(args, "pathname").map_err(invalid_args)?;
        // path should be absolute, except for e.g memfd_create files
        if !path.starts_with('/') {
            return Ok(());
        }
        let dev: u32 = get_arg(args, "dev").map_err(invalid_args)?;
        let inode: u64 = get_arg(args, "inode").map_err(invalid_args)?;

        let key = WrittenFiles::key(ctx.mnt_id, dev, inode);
        if lock(&self.written_files).index(key, path) {
            log::trace!("indexed write to {path} (mnt {}, dev {dev}, inode {inode})", ctx.mnt_id);
        }
        Ok(())
    }

    fn on_exec(
        &self,
        ctx: &mut EventContext,
        args: &mut Args,
        arg_metas: &mut Vec<ArgMeta>,
    ) -> Result<(), ProcessError> {
        {
            let mut mntns_pids = lock(&self.mntns_pids);
            if ctx.pid == Pid::from_raw(1) {
                mntns_pids.force_add(ctx.mnt_id, ctx.host_pid);
            } else {
                mntns_pids.add(ctx.mnt_id, ctx.host_pid);
            }
        }

        if !self.config.capture_exec && !self.config.exec_hash {
            return Ok(());
        }
        let invalid_args = |source| ProcessError::InvalidArgs {
            event: ctx.event_id,
            source,
        };
        let path: String = get_arg::<&str>(args, "pathname")
            .map_err(invalid_args)?
            .to_string();
        if !path.starts_with('/') {
            return Ok(());
        }
        let ctime: i64 = get_arg(args, "ctime").map_err(invalid_args)?;

        // The process which generated the event might have already exited:
        // go through any process still alive in the same mount namespace.
        let source = self.resolve_in_mntns(ctx.mnt_id, &path)?;
        let captured_id = CapturedFiles::id(ctx.mnt_id, &source);

        if self.config.capture_exec {
            self.capture_exec(ctx, &path, &source, &captured_id, ctime)?;
        }

        if self.config.exec_hash {
            let hash = self
                .hash_cache
                .get_or_compute(&captured_id, ctime, || sha256_file(&source))
                .map_err(|source_err| ProcessError::Hash {
                    path: source.clone(),
                    source: source_err,
                })?;
            arg_metas.push(ArgMeta::new(HASH_ARG_NAME, HASH_ARG_TYPE));
            ctx.argnum = ctx.argnum.saturating_add(1);
            args.insert(HASH_ARG_NAME.to_string(), hash.into());
        }

        Ok(())
    }

    /// Path of `path` as seen by the first living process of `mnt_id`.
    fn resolve_in_mntns(&self, mnt_id: u32, path: &str) -> Result<PathBuf, ProcessError> {
        let candidates = lock(&self.mntns_pids).get_bucket(mnt_id);
        let mut last_error = None;
        for pid in candidates {
            match procfs::resolve_in_process_root(pid, path) {
                Ok(resolved) => return Ok(resolved),
                Err(err) => {
                    log::trace!("{path} not reachable through {pid}: {err}");
                    last_error = Some(err);
                }
            }
        }
        Err(match last_error {
            Some(err) => err.into(),
            None => ProcessError::NoProcessInNamespace {
                mnt_id,
                path: path.to_string(),
            },
        })
    }

    fn capture_exec(
        &self,
        ctx: &EventContext,
        path: &str,
        source: &Path,
        captured_id: &str,
        ctime: i64,
    ) -> Result<(), ProcessError> {
        let destination_dir = self.config.output_path.join(ctx.mnt_id.to_string());
        DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(&destination_dir)
            .map_err(|source| ProcessError::CreateDir {
                path: destination_dir.clone(),
                source,
            })?;
        let base_name = base_name(path);
        let destination = destination_dir.join(format!("exec.{}.{base_name}", ctx.ts));

        if self.config.capture_profile {
            let profile_key = format!(
                "{}:{ctime}",
                destination_dir.join(format!("exec.{base_name}")).display()
            );
            self.profile.update(profile_key, ctx.ts);
        }

        // don't capture the same file twice unless it was modified.
        // The lock is held until the copy is recorded.
        let mut captured_files = lock(&self.captured_files);
        if captured_files.is_unchanged(captured_id, ctime) {
            return Ok(());
        }
        copy_file(source, &destination).map_err(|err| ProcessError::Capture {
            src: source.to_path_buf(),
            dst: destination.clone(),
            source: err,
        })?;
        log::debug!("captured {path} to {}", destination.display());
        captured_files.mark_captured(captured_id.to_string(), ctime);
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
