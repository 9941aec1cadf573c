use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

/// Where and how verbosely the host logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
    pub log_file: String,
}

impl LogConfig {
    pub fn new(log_level: impl Into<String>, log_dir: Option<PathBuf>) -> Self {
        Self { log_level: log_level.into(), log_dir, log_file: "plugin-host.log".to_string() }
    }

    /// `RUST_LOG` wins over the configured level.
    pub fn filter(&self) -> EnvFilter {
        let base = std::env::var("RUST_LOG").unwrap_or_else(|_| self.log_level.clone());
        EnvFilter::new(format!("{base},hyper=off,reqwest=warn"))
    }
}

/// Install the global subscriber.
///
/// With a log directory, events go to a daily rolling file through a
/// non-blocking writer; keep the returned guard alive until exit so the
/// buffer is flushed. Without one, events go to stderr.
pub fn init_tracing(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let (writer, guard) = tracing_appender::non_blocking(rolling_file(dir, &config.log_file));
            Registry::default()
                .with(config.filter())
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .try_init()?;
            Ok(Some(guard))
        }
        None => {
            Registry::default()
                .with(config.filter())
                .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
                .try_init()?;
            Ok(None)
        }
    }
}

fn rolling_file(dir: &Path, file: &str) -> RollingFileAppender {
    RollingFileAppender::new(Rotation::DAILY, dir, file)
}
