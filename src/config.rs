use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://tableq.db?mode=rwc";

/// Process-level configuration, read from `TABLEQ_*` environment variables.
#[derive(Clone, Default, Deserialize)]
pub struct Config {
    pub database_url: Option<String>,
    pub default_timeout: Option<f64>,
    pub poll_interval: Option<f64>,
    pub boost_poll_interval: Option<f64>,
    pub boost_time: Option<f64>,
    pub table_name: Option<String>,
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("TABLEQ_").from_env::<Self>()?)
    }

    pub fn database_url(&self) -> &str {
        self.database_url
            .as_deref()
            .unwrap_or(DEFAULT_DATABASE_URL)
    }

    /// Queue options with every unset variable left at its default.
    pub fn queue_options(&self) -> QueueOptions {
        let defaults = QueueOptions::default();

        QueueOptions {
            default_timeout: self.default_timeout.unwrap_or(defaults.default_timeout),
            poll_interval: self.poll_interval.unwrap_or(defaults.poll_interval),
            boost_poll_interval: self
                .boost_poll_interval
                .unwrap_or(defaults.boost_poll_interval),
            boost_time: self.boost_time.unwrap_or(defaults.boost_time),
            table_name: self.table_name.clone(),
        }
    }
}

/// Per-queue tuning. All durations are in (fractional) seconds.
#[derive(Debug, Clone, PartialEq, Deserialize, bon::Builder)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueOptions {
    /// How long a blocking reserve waits when the caller gives no timeout
    #[builder(default = 60.0)]
    pub default_timeout: f64,
    /// Polling cadence while idle
    #[builder(default = 1.0)]
    pub poll_interval: f64,
    /// Polling cadence while boost mode is active
    #[builder(default = 0.5)]
    pub boost_poll_interval: f64,
    /// How long boost mode lasts after the last successful reservation
    #[builder(default = 10.0)]
    pub boost_time: f64,
    /// Overrides the table name derived from the queue name
    #[builder(into)]
    pub table_name: Option<String>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// [`QueueOptions`] after validation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Timing {
    pub default_timeout: Duration,
    pub poll_interval: Duration,
    pub boost_poll_interval: Duration,
    pub boost_time: Duration,
}

impl QueueOptions {
    pub(crate) fn timing(&self) -> Result<Timing, Error> {
        Ok(Timing {
            default_timeout: seconds("defaultTimeout", self.default_timeout)?,
            poll_interval: seconds("pollInterval", self.poll_interval)?,
            boost_poll_interval: seconds("boostPollInterval", self.boost_poll_interval)?,
            boost_time: seconds("boostTime", self.boost_time)?,
        })
    }

    /// Resolves the storage table for a queue, checking that it is a plain
    /// identifier since it ends up inside SQL text.
    pub(crate) fn table_name_for(&self, queue: &str) -> Result<String, Error> {
        let table = match &self.table_name {
            Some(name) => name.clone(),
            None => format!("tableq_messages_{queue}"),
        };

        if table.is_empty()
            || !table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(Error::invalid_parameter(format!(
                "tableName: {table:?} must only contain ASCII letters, digits and underscores"
            )));
        }

        Ok(table)
    }
}

fn seconds(name: &str, value: f64) -> Result<Duration, Error> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| Error::invalid_parameter(format!("{name}: {value} ({e})")))
}
