use crate::config::PhoneConfig;
use anyhow::Result;
use std::fs::File;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;

/// Installs the global fmt subscriber described by `config`.
///
/// The returned guard flushes the file writer on drop and must be kept
/// alive by the host for as long as it logs. Calling this again after a
/// subscriber is installed is a no-op.
pub fn init(config: &PhoneConfig) -> Result<Option<WorkerGuard>> {
    let mut log_fmt = tracing_subscriber::fmt();
    if let Some(ref level) = config.log_level {
        if let Ok(lv) = level.as_str().parse::<LevelFilter>() {
            log_fmt = log_fmt.with_max_level(lv);
        }
    }

    if let Some(ref log_file) = config.log_file {
        let file = File::create(log_file)
            .map_err(|e| anyhow::anyhow!("failed to create log file {}: {}", log_file, e))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        log_fmt.with_writer(non_blocking).try_init().ok();
        Ok(Some(guard))
    } else {
        log_fmt.try_init().ok();
        Ok(None)
    }
}
