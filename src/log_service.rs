use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use crate::config::{LogConfig, RotationConfig};

const LOG_FILE_NAME: &str = "coordinator.log";

pub struct LogService;

impl LogService {
    pub fn init_for_test() {
        let _ = Registry::default()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init();
    }

    /// Installs the stderr and rolling-file layers. Each application logs
    /// into its own directory, so coordinators of concurrently running
    /// drivers on one host never interleave their files. `RUST_LOG` still
    /// overrides the configured level. The returned guard keeps the
    /// background flusher alive.
    pub fn init(app_id: &str, log: &LogConfig) -> WorkerGuard {
        let (file_writer, guard) =
            tracing_appender::non_blocking(Self::rolling_appender(log, app_id));

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(log.level.clone()));
        let stderr_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
        let file_layer = fmt::layer()
            .with_ansi(false)
            .with_line_number(true)
            .with_writer(file_writer);

        Registry::default()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();

        guard
    }

    fn rolling_appender(log: &LogConfig, app_id: &str) -> RollingFileAppender {
        let log_dir: PathBuf = Path::new(&log.path).join(app_id);
        match log.rotation {
            RotationConfig::Hourly => tracing_appender::rolling::hourly(&log_dir, LOG_FILE_NAME),
            RotationConfig::Daily => tracing_appender::rolling::daily(&log_dir, LOG_FILE_NAME),
            RotationConfig::Never => tracing_appender::rolling::never(&log_dir, LOG_FILE_NAME),
        }
    }
}
