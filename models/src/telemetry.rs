//! Process-wide tracing initialization, configured through the environment.

use serde::Deserialize;
use snafu::ResultExt;
use std::env;
use tracing_subscriber::{filter::LevelFilter, fmt, layer::SubscriberExt, EnvFilter, Registry};

const DEFAULT_TRACING_FILTER_DIRECTIVE: LevelFilter = LevelFilter::INFO;

const TRACING_FILTER_DIRECTIVE_ENV_VAR: &str = "TRACING_FILTER_DIRECTIVE";
const LOGGING_FORMATTER_ENV_VAR: &str = "LOGGING_FORMATTER";
const LOGGING_ANSI_ENABLED_ENV_VAR: &str = "LOGGING_ANSI_ENABLED";

/// The message format for logging tracing events.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageFormat {
    /// Human-readable, single-line logs for each event.
    Full,
    /// A variant of the default formatter optimized for short line lengths.
    Compact,
    /// Pretty-formatted multi-line logs optimized for human readability.
    #[default]
    Pretty,
    /// Newline-delimited JSON logs.
    Json,
}

impl MessageFormat {
    fn try_from_env() -> Result<Self> {
        match env::var(LOGGING_FORMATTER_ENV_VAR) {
            Ok(value) => serde_plain::from_str(&value).context(error::LogFormatterEnvSnafu {
                env_value: value.as_str(),
            }),
            Err(_) => Ok(Self::default()),
        }
    }
}

fn ansi_enabled_from_env() -> Result<bool> {
    match env::var(LOGGING_ANSI_ENABLED_ENV_VAR) {
        Ok(value) => value
            .to_lowercase()
            .parse()
            .context(error::LogAnsiEnvSnafu {
                env_value: value.as_str(),
            }),
        Err(_) => Ok(false),
    }
}

pub fn init_telemetry_from_env() -> Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(DEFAULT_TRACING_FILTER_DIRECTIVE.into())
        .with_env_var(TRACING_FILTER_DIRECTIVE_ENV_VAR)
        .from_env_lossy();
    let registry = Registry::default().with(env_filter);
    let ansi_enabled = ansi_enabled_from_env()?;

    // The formatting layers are all distinct types, so each arm boxes its own
    // subscriber.
    let subscriber: Box<dyn tracing::Subscriber + Send + Sync> =
        match MessageFormat::try_from_env()? {
            MessageFormat::Full => Box::new(registry.with(fmt::layer().with_ansi(ansi_enabled))),
            MessageFormat::Compact => {
                Box::new(registry.with(fmt::layer().compact().with_ansi(ansi_enabled)))
            }
            MessageFormat::Pretty => {
                Box::new(registry.with(fmt::layer().pretty().with_ansi(ansi_enabled)))
            }
            MessageFormat::Json => {
                Box::new(registry.with(fmt::layer().json().with_ansi(ansi_enabled)))
            }
        };
    tracing::subscriber::set_global_default(subscriber).context(error::TracingConfigurationSnafu)
}

pub mod error {
    use super::*;
    use snafu::Snafu;
    use std::str::ParseBoolError;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum TelemetryConfigError {
        #[snafu(display("Error configuring tracing: '{}'", source))]
        TracingConfiguration {
            source: tracing::subscriber::SetGlobalDefaultError,
        },

        #[snafu(display(
            "Could not parse formatter from environment variable '{}={}': '{}'",
            LOGGING_FORMATTER_ENV_VAR,
            env_value,
            source
        ))]
        LogFormatterEnv {
            source: serde_plain::Error,
            env_value: String,
        },

        #[snafu(display(
            "Could not parse ANSI enablement from environment variable '{}={}': '{}'",
            LOGGING_ANSI_ENABLED_ENV_VAR,
            env_value,
            source
        ))]
        LogAnsiEnv {
            source: ParseBoolError,
            env_value: String,
        },
    }
}

type Result<T> = std::result::Result<T, TelemetryConfigError>;
pub use error::TelemetryConfigError;
