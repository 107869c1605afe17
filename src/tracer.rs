use std::sync::Arc;

use anyhow::{Context, Result};
use bpf_common::MapProvider;
use event_processor::{Config, EventProcessor, MODULE_NAME, start_lost_events_drain};
use ktrace_core::stats::{Stats, StatsSnapshot};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::config::KtraceConfig;

/// File name of the execution profile, written in the capture output directory.
pub const PROFILE_FILE_NAME: &str = "ktrace.profile";

/// A running tracing session: the shared event processor and the task
/// accounting for the events lost by the kernel buffers.
pub struct Tracer {
    processor: Arc<EventProcessor>,
    stats: Arc<Stats>,
    tx_lost: mpsc::UnboundedSender<u64>,
    lost_events_drain: JoinHandle<()>,
}

impl Tracer {
    /// Start a session. Must be called from within a tokio runtime.
    pub fn start(config: &KtraceConfig, maps: Option<Arc<dyn MapProvider>>) -> Result<Self> {
        let module_config = config.get_module_config(MODULE_NAME);
        let processor_config = Config::try_from(&module_config)
            .with_context(|| format!("Invalid {MODULE_NAME} configuration"))?;
        log::debug!("{MODULE_NAME} configuration: {processor_config:?}");

        let stats = Arc::new(Stats::default());
        let processor = Arc::new(EventProcessor::new(
            processor_config,
            stats.clone(),
            maps,
        ));
        let (tx_lost, rx_lost) = mpsc::unbounded_channel();
        let lost_events_drain = start_lost_events_drain(rx_lost, stats.clone());

        Ok(Self {
            processor,
            stats,
            tx_lost,
            lost_events_drain,
        })
    }

    /// Shared processor, to be handed to every event reader.
    pub fn processor(&self) -> Arc<EventProcessor> {
        self.processor.clone()
    }

    /// Channel where the kernel buffer readers report lost events.
    pub fn lost_events_sender(&self) -> mpsc::UnboundedSender<u64> {
        self.tx_lost.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop the session, once every reader has dropped its lost events sender.
    /// The execution profile is exported if profiling is enabled.
    pub async fn shutdown(self) -> Result<StatsSnapshot> {
        let Self {
            processor,
            stats,
            tx_lost,
            lost_events_drain,
        } = self;
        drop(tx_lost);
        lost_events_drain
            .await
            .context("Lost events drain terminated abnormally")?;

        let config = processor.config();
        if config.capture_profile {
            std::fs::create_dir_all(&config.output_path)
                .with_context(|| format!("Error creating {:?}", config.output_path))?;
            let profile_path = config.output_path.join(PROFILE_FILE_NAME);
            processor
                .profile()
                .write_profile(&profile_path)
                .with_context(|| format!("Error writing profile to {profile_path:?}"))?;
            log::info!("Execution profile written to {}", profile_path.display());
        }

        let snapshot = stats.snapshot();
        log::info!("Tracing session terminated ({snapshot})");
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use bpf_common::{Pid, time::Timestamp};
    use ktrace_core::event::{ArgValue, Args, EventContext, EventId};

    use super::*;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn exec_event(ts: u64) -> EventContext {
        EventContext {
            ts: Timestamp::from(ts),
            pid: Pid::this(),
            host_pid: Pid::this(),
            mnt_id: 1,
            event_id: EventId::SCHED_PROCESS_EXEC,
            retval: 0,
            argnum: 2,
        }
    }

    #[tokio::test]
    async fn session_with_profile() {
        init_logger();
        let workdir = tempfile::tempdir().unwrap();
        let binary = workdir.path().join("tool");
        std::fs::write(&binary, b"\x7fELF").unwrap();
        let output = workdir.path().join("out");

        let mut config = KtraceConfig::default();
        config.set(MODULE_NAME, "capture_exec", "true");
        config.set(MODULE_NAME, "capture_profile", "true");
        config.set(MODULE_NAME, "capture_output_path", output.to_str().unwrap());
        let tracer = Tracer::start(&config, None).unwrap();

        let processor = tracer.processor();
        for ts in [10, 20] {
            let mut args = Args::from([
                ("pathname".to_string(), ArgValue::from(binary.to_str().unwrap())),
                ("ctime".to_string(), ArgValue::Int64(1000)),
            ]);
            assert!(processor.handle(&mut exec_event(ts), &mut args, &mut Vec::new()));
        }
        let tx_lost = tracer.lost_events_sender();
        tx_lost.send(4).unwrap();
        drop(tx_lost);
        drop(processor);

        let stats = tracer.shutdown().await.unwrap();
        assert_eq!(stats.events, 2);
        assert_eq!(stats.lost_events, 4);
        assert_eq!(stats.errors, 0);

        let profile: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(output.join(PROFILE_FILE_NAME)).unwrap())
                .unwrap();
        let key = format!("{}:1000", output.join("1").join("exec.tool").display());
        assert_eq!(profile[&key]["times"], 2);
        assert_eq!(profile[&key]["first_execution_ts"], 10);
    }

    #[tokio::test]
    async fn no_profile_by_default() {
        let output = tempfile::tempdir().unwrap();
        let mut config = KtraceConfig::default();
        config.set(MODULE_NAME, "capture_output_path", output.path().to_str().unwrap());
        let tracer = Tracer::start(&config, None).unwrap();
        tracer.shutdown().await.unwrap();
        assert!(!output.path().join(PROFILE_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn invalid_configuration() {
        let config = KtraceConfig::from_ini_str("[event-processor]\npid_bucket_size=1\n").unwrap();
        assert!(Tracer::start(&config, None).is_err());
    }
}
