//! Types shared by every part of the tracer: the decoded event
//! representation, module configuration and runtime statistics.

pub mod config;
pub mod event;
pub mod stats;

pub use bpf_common::{Pid, time::Timestamp};
