use std::collections::BTreeMap;

use eyre::Result;
use serde::Deserialize;
use tracing_subscriber::{
    filter::{LevelFilter, Targets},
    fmt,
    prelude::*,
    Layer, Registry,
};

/// Logging level. A "higher level" means more will be logged.
#[derive(Default, Debug, Clone, Copy, Deserialize, PartialOrd, Ord, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Level {
    /// Off
    Off = 0,
    /// Error
    Error = 1,
    /// Warn
    Warn = 2,
    /// Debug
    Debug = 4,
    /// Trace
    Trace = 5,
    /// Info
    #[serde(other)]
    #[default]
    Info = 3,
}

impl From<Level> for LevelFilter {
    fn from(level: Level) -> LevelFilter {
        match level {
            Level::Off => LevelFilter::OFF,
            Level::Error => LevelFilter::ERROR,
            Level::Warn => LevelFilter::WARN,
            Level::Debug => LevelFilter::DEBUG,
            Level::Trace => LevelFilter::TRACE,
            Level::Info => LevelFilter::INFO,
        }
    }
}

/// Output format of the log lines.
#[derive(Default, Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Style {
    /// Multi-line, human readable
    Pretty,
    /// One JSON object per line
    Json,
    /// Fields and spans abbreviated
    Compact,
    /// The default formatter
    #[default]
    #[serde(other)]
    Full,
}

impl Style {
    fn layer(self) -> Box<dyn Layer<Registry> + Send + Sync> {
        match self {
            Style::Pretty => fmt::layer().pretty().boxed(),
            Style::Json => fmt::layer().json().boxed(),
            Style::Compact => fmt::layer().compact().boxed(),
            Style::Full => fmt::layer().boxed(),
        }
    }
}

/// Configuration of the tracing subscriber.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TracingConfig {
    /// Output format
    #[serde(default)]
    pub fmt: Style,
    /// Most verbose level logged
    #[serde(default)]
    pub level: Level,
    /// Per-target levels, e.g. `logpoller::poller` at `trace`
    #[serde(default)]
    pub targets: BTreeMap<String, Level>,
}

impl TracingConfig {
    fn targets(&self) -> Targets {
        let mut targets = Targets::new().with_default(self.level);
        if self.level < Level::Trace {
            // rpc transport and per-statement logs only at trace level
            for target in ["hyper", "reqwest", "ethers_providers"] {
                targets = targets.with_target(target, Level::Info);
            }
            targets = targets.with_target("sqlx::query", Level::Warn);
        }
        self.targets
            .iter()
            .fold(targets, |targets, (target, level)| {
                targets.with_target(target.clone(), *level)
            })
    }

    /// Register the global subscriber. Fails if one is already set.
    pub fn start_tracing(&self) -> Result<()> {
        let subscriber = Registry::default()
            .with(self.fmt.layer())
            .with(self.targets())
            .with(tracing_error::ErrorLayer::default());

        subscriber.try_init()?;
        Ok(())
    }
}
