//! Installs the global `tracing` subscriber of an InstanceSet controller.

use std::path::{Path, PathBuf};

use snafu::{ResultExt, Snafu};
use tracing_appender::rolling::{InitError, RollingFileAppender};
use tracing_subscriber::{
    EnvFilter, Layer as _, Registry,
    filter::ParseError,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to initialize default tracing level to INFO"))]
    DefaultFilter { source: ParseError },

    #[snafu(display("failed to initialize rolling file appender in {}", directory.display()))]
    RollingFileAppender {
        source: InitError,
        directory: PathBuf,
    },

    #[snafu(display("failed to install the global tracing subscriber"))]
    InstallSubscriber { source: TryInitError },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum LogFormat {
    /// Human readable, one line per event.
    #[default]
    Plain,

    /// One JSON object per event.
    Json,
}

/// Installs a subscriber printing to stdout in the given `format`.
///
/// Filter directives are read from the environment variable named `env`, e.g.
/// `INSTANCESET_LOG=stackable_instanceset=debug`. Without it only INFO and above is logged.
///
/// If `{env}_DIRECTORY` points to a directory, every event is additionally written as JSON into
/// `*.{app_name}.log` files in there, rotated by the appender.
pub fn initialize_logging(env: &str, app_name: &str, format: LogFormat) -> Result<(), Error> {
    let filter = env_filter(env)?;

    let log_directory = std::env::var_os(format!("{env}_DIRECTORY")).map(PathBuf::from);
    let file_layer = log_directory
        .as_deref()
        .map(|directory| rolling_file_appender(directory, app_name))
        .transpose()?
        .map(|appender| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(appender)
        });

    let console_layer = match format {
        LogFormat::Plain => tracing_subscriber::fmt::layer().boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
    };

    Registry::default()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context(InstallSubscriberSnafu)?;

    match log_directory {
        Some(directory) => tracing::info!(directory = %directory.display(), "writing log files"),
        None => tracing::debug!("no log directory configured, logging to stdout only"),
    }

    Ok(())
}

fn env_filter(env: &str) -> Result<EnvFilter, Error> {
    match EnvFilter::try_from_env(env) {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(tracing::Level::INFO.to_string()).context(DefaultFilterSnafu),
    }
}

fn rolling_file_appender(directory: &Path, app_name: &str) -> Result<RollingFileAppender, Error> {
    RollingFileAppender::builder()
        .filename_suffix(format!("{app_name}.log"))
        .max_log_files(6)
        .build(directory)
        .context(RollingFileAppenderSnafu { directory })
}
