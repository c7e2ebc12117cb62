//! Logging setup
//!
//! `RUST_LOG` wins over the configured level at startup. Afterwards the
//! level follows `log_level` in the configuration file, applied through a
//! reload handle whenever the file changes.
//!
//! Logs go to stderr; stdout is reserved for `--output -`.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

/// Handle to change the global log level at runtime
#[derive(Clone)]
pub struct LogLevelHandle {
    inner: reload::Handle<EnvFilter, Registry>,
}

impl LogLevelHandle {
    /// Replace the active filter with `level`
    pub fn set_level(&self, level: &str) -> anyhow::Result<()> {
        let filter = EnvFilter::try_new(level)?;
        self.inner.reload(filter)?;
        Ok(())
    }
}

/// Install the global subscriber
pub fn init(level: &str) -> anyhow::Result<LogLevelHandle> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let (filter_layer, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()?;

    Ok(LogLevelHandle { inner: handle })
}
