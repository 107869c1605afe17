use std::{collections::HashMap, fmt, str::FromStr};

use bpf_common::{Pid, time::Timestamp};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of a class of kernel events.
///
/// Ids below 1000 are raw syscalls (x86_64 numbering), the others are
/// events generated by dedicated probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub i32);

impl EventId {
    pub const WRITE: EventId = EventId(1);
    pub const OPEN: EventId = EventId(2);
    pub const MMAP: EventId = EventId(9);
    pub const MPROTECT: EventId = EventId(10);
    pub const CONNECT: EventId = EventId(42);
    pub const SOCKET: EventId = EventId(41);
    pub const EXECVE: EventId = EventId(59);
    pub const SYS_ENTER: EventId = EventId(1000);
    pub const SYS_EXIT: EventId = EventId(1001);
    pub const SCHED_PROCESS_FORK: EventId = EventId(1002);
    pub const SCHED_PROCESS_EXEC: EventId = EventId(1003);
    pub const SCHED_PROCESS_EXIT: EventId = EventId(1004);
    pub const DO_EXIT: EventId = EventId(1006);
    pub const CAP_CAPABLE: EventId = EventId(1007);
    pub const VFS_WRITE: EventId = EventId(1008);
    pub const VFS_WRITEV: EventId = EventId(1009);
    pub const SECURITY_BPRM_CHECK: EventId = EventId(1011);

    /// Returns the well-known name of this event, if any.
    pub fn name(&self) -> Option<&'static str> {
        EVENT_NAMES
            .iter()
            .find(|(id, _)| id == self)
            .map(|(_, name)| *name)
    }

    /// Key used for this event in kernel tables indexed by event id.
    pub fn to_key(&self) -> [u8; 4] {
        (self.0 as u32).to_ne_bytes()
    }
}

const EVENT_NAMES: &[(EventId, &str)] = &[
    (EventId::WRITE, "write"),
    (EventId::OPEN, "open"),
    (EventId::MMAP, "mmap"),
    (EventId::MPROTECT, "mprotect"),
    (EventId::SOCKET, "socket"),
    (EventId::CONNECT, "connect"),
    (EventId::EXECVE, "execve"),
    (EventId::SYS_ENTER, "sys_enter"),
    (EventId::SYS_EXIT, "sys_exit"),
    (EventId::SCHED_PROCESS_FORK, "sched_process_fork"),
    (EventId::SCHED_PROCESS_EXEC, "sched_process_exec"),
    (EventId::SCHED_PROCESS_EXIT, "sched_process_exit"),
    (EventId::DO_EXIT, "do_exit"),
    (EventId::CAP_CAPABLE, "cap_capable"),
    (EventId::VFS_WRITE, "vfs_write"),
    (EventId::VFS_WRITEV, "vfs_writev"),
    (EventId::SECURITY_BPRM_CHECK, "security_bprm_check"),
];

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "event_{}", self.0),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("unknown event {0}")]
pub struct UnknownEvent(String);

impl FromStr for EventId {
    type Err = UnknownEvent;

    /// Accepts both event names and raw numeric ids.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((id, _)) = EVENT_NAMES.iter().find(|(_, name)| *name == s) {
            return Ok(*id);
        }
        s.parse::<i32>()
            .map(EventId)
            .map_err(|_| UnknownEvent(s.to_string()))
    }
}

/// Identity of a single kernel event, as decoded from the trace buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventContext {
    pub ts: Timestamp,
    /// Pid as seen from the process' own pid namespace
    pub pid: Pid,
    /// Pid as seen from the host
    pub host_pid: Pid,
    /// Mount namespace id
    pub mnt_id: u32,
    pub event_id: EventId,
    pub retval: i64,
    /// Number of arguments carried by the event
    pub argnum: u8,
}

/// Value of a decoded event argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Str(String),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    StrArray(Vec<String>),
    Bytes(Vec<u8>),
}

impl ArgValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ArgValue::Str(_) => "string",
            ArgValue::Int32(_) => "i32",
            ArgValue::UInt32(_) => "u32",
            ArgValue::Int64(_) => "i64",
            ArgValue::UInt64(_) => "u64",
            ArgValue::StrArray(_) => "string array",
            ArgValue::Bytes(_) => "bytes",
        }
    }
}

/// Canonical textual form, used when matching argument filters.
impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Str(value) => write!(f, "{value}"),
            ArgValue::Int32(value) => write!(f, "{value}"),
            ArgValue::UInt32(value) => write!(f, "{value}"),
            ArgValue::Int64(value) => write!(f, "{value}"),
            ArgValue::UInt64(value) => write!(f, "{value}"),
            ArgValue::StrArray(values) => write!(f, "[{}]", values.join(" ")),
            ArgValue::Bytes(bytes) => {
                let bytes: Vec<String> = bytes.iter().map(u8::to_string).collect();
                write!(f, "[{}]", bytes.join(" "))
            }
        }
    }
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        ArgValue::Str(value.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(value: String) -> Self {
        ArgValue::Str(value)
    }
}

macro_rules! impl_arg_conversions {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for ArgValue {
                fn from(value: $ty) -> Self {
                    ArgValue::$variant(value)
                }
            }

            impl TryFrom<&ArgValue> for $ty {
                type Error = &'static str;

                fn try_from(value: &ArgValue) -> Result<Self, Self::Error> {
                    match value {
                        ArgValue::$variant(value) => Ok(*value),
                        other => Err(other.type_name()),
                    }
                }
            }
        )*
    };
}

impl_arg_conversions!(Int32 => i32, UInt32 => u32, Int64 => i64, UInt64 => u64);

impl<'a> TryFrom<&'a ArgValue> for &'a str {
    type Error = &'static str;

    fn try_from(value: &'a ArgValue) -> Result<Self, Self::Error> {
        match value {
            ArgValue::Str(value) => Ok(value.as_str()),
            other => Err(other.type_name()),
        }
    }
}

/// Decoded event arguments by name.
pub type Args = HashMap<String, ArgValue>;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ArgError {
    #[error("argument {name} is missing")]
    Missing { name: String },
    #[error("argument {name} has type {found}, expected {expected}")]
    WrongType {
        name: String,
        expected: &'static str,
        found: &'static str,
    },
}

/// Returns the argument `name` converted to `T`.
///
/// ```
/// use ktrace_core::event::{ArgValue, Args, get_arg};
///
/// let mut args = Args::new();
/// args.insert("dev".to_string(), ArgValue::UInt32(8));
/// let dev: u32 = get_arg(&args, "dev").unwrap();
/// assert_eq!(dev, 8);
/// assert!(get_arg::<u64>(&args, "dev").is_err());
/// ```
pub fn get_arg<'a, T>(args: &'a Args, name: &str) -> Result<T, ArgError>
where
    T: TryFrom<&'a ArgValue, Error = &'static str>,
{
    let value = args.get(name).ok_or_else(|| ArgError::Missing {
        name: name.to_string(),
    })?;
    T::try_from(value).map_err(|found| ArgError::WrongType {
        name: name.to_string(),
        expected: std::any::type_name::<T>(),
        found,
    })
}

/// Name and C type of an event argument, as shown to consumers of the event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgMeta {
    pub name: String,
    #[serde(rename = "type")]
    pub arg_type: String,
}

impl ArgMeta {
    pub fn new(name: &str, arg_type: &str) -> Self {
        Self {
            name: name.to_string(),
            arg_type: arg_type.to_string(),
        }
    }
}
