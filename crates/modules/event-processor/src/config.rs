use std::{collections::HashMap, path::PathBuf};

use ktrace_core::{
    config::{ConfigError, ModuleConfig},
    event::EventId,
};

use crate::filtering::{ArgCondition, ArgFilter, Filters, RetCondition, RetFilter};

pub const DEFAULT_OUTPUT_PATH: &str = "/tmp/ktrace/out";
pub const DEFAULT_HASH_CACHE_SIZE: u64 = 1024;
pub const DEFAULT_PID_BUCKET_SIZE: usize = 5;

const RETVAL_FILTER_PREFIX: &str = "retval_filter.";
const ARGS_FILTER_PREFIX: &str = "args_filter.";

/// [`Config`] contains the capture toggles and the filters applied
/// by the event processor.
#[derive(Clone, Debug)]
pub struct Config {
    /// Index written files
    pub capture_write: bool,
    /// Copy executed files to `output_path`
    pub capture_exec: bool,
    /// Keep an execution profile of captured files
    pub capture_profile: bool,
    /// Add the sha256 of executed files to exec events
    pub exec_hash: bool,
    /// Root of the captured artifacts
    pub output_path: PathBuf,
    /// Max number of entries in the hash cache
    pub hash_cache_size: u64,
    /// Max number of pids remembered per mount namespace
    pub pid_bucket_size: usize,
    pub filters: Filters,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture_write: false,
            capture_exec: false,
            capture_profile: false,
            exec_hash: false,
            output_path: PathBuf::from(DEFAULT_OUTPUT_PATH),
            hash_cache_size: DEFAULT_HASH_CACHE_SIZE,
            pid_bucket_size: DEFAULT_PID_BUCKET_SIZE,
            filters: Filters::default(),
        }
    }
}

/// Extract Config from configuration file
impl TryFrom<&ModuleConfig> for Config {
    type Error = ConfigError;

    fn try_from(config: &ModuleConfig) -> Result<Self, Self::Error> {
        let pid_bucket_size = config.with_default("pid_bucket_size", DEFAULT_PID_BUCKET_SIZE)?;
        if pid_bucket_size < 2 {
            return Err(ConfigError::InvalidValue {
                field: "pid_bucket_size".to_string(),
                value: pid_bucket_size.to_string(),
                err: "must be at least 2".to_string(),
            });
        }
        Ok(Config {
            capture_write: config.with_default("capture_write", false)?,
            capture_exec: config.with_default("capture_exec", false)?,
            capture_profile: config.with_default("capture_profile", false)?,
            exec_hash: config.with_default("output_exec_hash", false)?,
            output_path: config.with_default(
                "capture_output_path",
                PathBuf::from(DEFAULT_OUTPUT_PATH),
            )?,
            hash_cache_size: config.with_default("hash_cache_size", DEFAULT_HASH_CACHE_SIZE)?,
            pid_bucket_size,
            filters: parse_filters(config)?,
        })
    }
}

/// Filters are written as:
///
/// ```ini
/// retval_filter.open = !=-2, !=-13
/// args_filter.sched_process_exec.pathname = =/usr/bin/*, !=/usr/bin/sudo
/// ```
fn parse_filters(config: &ModuleConfig) -> Result<Filters, ConfigError> {
    let mut retval: HashMap<EventId, RetFilter> = HashMap::new();
    for (event, _) in config.with_prefix(RETVAL_FILTER_PREFIX) {
        let field = format!("{RETVAL_FILTER_PREFIX}{event}");
        let event_id = parse_event(&field, event)?;
        let filter = retval.entry(event_id).or_default();
        for condition in config.get_list::<RetCondition>(&field)? {
            filter.apply(condition);
        }
    }

    let mut args: HashMap<EventId, HashMap<String, ArgFilter>> = HashMap::new();
    for (key, _) in config.with_prefix(ARGS_FILTER_PREFIX) {
        let field = format!("{ARGS_FILTER_PREFIX}{key}");
        let (event, arg_name) = key.split_once('.').ok_or_else(|| ConfigError::InvalidValue {
            field: field.clone(),
            value: key.to_string(),
            err: "expected <event>.<argument>".to_string(),
        })?;
        let event_id = parse_event(&field, event)?;
        let filter = args
            .entry(event_id)
            .or_default()
            .entry(arg_name.to_string())
            .or_default();
        for condition in config.get_list::<ArgCondition>(&field)? {
            filter.apply(condition);
        }
    }

    Ok(Filters {
        retval_enabled: config.with_default("retval_filter_enabled", !retval.is_empty())?,
        retval,
        args_enabled: config.with_default("args_filter_enabled", !args.is_empty())?,
        args,
    })
}

fn parse_event(field: &str, event: &str) -> Result<EventId, ConfigError> {
    event.parse().map_err(|err: ktrace_core::event::UnknownEvent| {
        ConfigError::InvalidValue {
            field: field.to_string(),
            value: event.to_string(),
            err: err.to_string(),
        }
    })
}
