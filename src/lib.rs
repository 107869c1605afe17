//! ktrace is the user-space side of a kernel tracer.
//!
//! Events decoded from the kernel buffers go through the
//! [event processor](event_processor::EventProcessor), which filters them,
//! keeps per-session indexes of written and executed files, quarantines
//! executed binaries and enriches exec events with their sha256.
//!
//! A [`Tracer`] wires a session together from an `INI` configuration file,
//! where the `[event-processor]` section configures the processor:
//!
//! ```ini
//! [event-processor]
//! capture_exec=true
//! output_exec_hash=true
//! retval_filter.vfs_write=>0
//! ```

mod config;
mod tracer;

pub use config::{DEFAULT_CONFIG_FILE, KtraceConfig};
pub use tracer::{PROFILE_FILE_NAME, Tracer};

pub use event_processor;
pub use ktrace_core;
