use std::sync::Once;

/// Logger setup for binaries and tests that drive a [`crate::Context`].
///
/// `filter` uses `env_logger` directive syntax, e.g.
/// `"gpu_context=trace,paging=debug"`. Without it `RUST_LOG` is honored,
/// then `default_level`.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub filter: Option<String>,
    pub default_level: log::LevelFilter,
    pub write_style: env_logger::WriteStyle,
    /// Routes output through the test harness capture.
    pub is_test: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: None,
            default_level: log::LevelFilter::Warn,
            write_style: env_logger::WriteStyle::Auto,
            is_test: false,
        }
    }
}

static INIT: Once = Once::new();

/// Installs the global logger. Only the first call has any effect; a logger
/// installed by someone else is left in place.
pub fn init_logging(config: LoggingConfig) {
    INIT.call_once(|| {
        let mut builder = env_logger::Builder::new();
        match config.filter.or_else(|| std::env::var("RUST_LOG").ok()) {
            Some(filter) => {
                builder.parse_filters(&filter);
            }
            None => {
                builder.filter_level(config.default_level);
            }
        }
        builder.write_style(config.write_style).is_test(config.is_test);

        if builder.try_init().is_err() {
            log::debug!("global logger already set, keeping it");
            return;
        }
        log::debug!("logging initialized");
    });
}
