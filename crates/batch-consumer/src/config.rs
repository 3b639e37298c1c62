// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer};
use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_MESSAGE_LIMIT: usize = 10;
pub const DEFAULT_TIME_LIMIT: Duration = Duration::from_secs(1);

/// What happens to a batch that is still open when its collector is disposed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownPolicy {
    /// Close the batch with reason `Shutdown` and deliver it as a short batch.
    #[default]
    Dispatch,
    /// Close the batch without consuming it. Every contributor fails with
    /// `BatchDiscarded` so the transport can redeliver the messages.
    Discard,
}

impl FromStr for ShutdownPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "dispatch" => Ok(Self::Dispatch),
            "discard" => Ok(Self::Discard),
            other => Err(Error::InvalidConfig(format!(
                "Invalid shutdown policy '{other}'. Must be one of: dispatch, discard"
            ))),
        }
    }
}

/// Limits that close a batch, plus the shutdown behaviour of its collector
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BatchOptions {
    /// Number of messages that closes a batch
    pub message_limit: usize,
    /// Maximum age of an open batch, measured from its first message
    #[serde(rename = "time_limit_ms", deserialize_with = "deserialize_millis")]
    pub time_limit: Duration,
    pub shutdown_policy: ShutdownPolicy,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            message_limit: DEFAULT_MESSAGE_LIMIT,
            time_limit: DEFAULT_TIME_LIMIT,
            shutdown_policy: ShutdownPolicy::default(),
        }
    }
}

fn deserialize_millis<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

impl BatchOptions {
    #[must_use]
    pub fn with_message_limit(mut self, message_limit: usize) -> Self {
        self.message_limit = message_limit;
        self
    }

    #[must_use]
    pub fn with_time_limit(mut self, time_limit: Duration) -> Self {
        self.time_limit = time_limit;
        self
    }

    #[must_use]
    pub fn with_shutdown_policy(mut self, shutdown_policy: ShutdownPolicy) -> Self {
        self.shutdown_policy = shutdown_policy;
        self
    }

    /// Create options from environment variables
    ///
    /// Unset or unparsable numbers fall back to the defaults; an unknown
    /// shutdown policy is rejected.
    pub fn from_env() -> Result<Self> {
        let message_limit = env::var("BATCH_MESSAGE_LIMIT")
            .ok()
            .and_then(|val| val.parse::<usize>().ok())
            .unwrap_or(DEFAULT_MESSAGE_LIMIT);
        let time_limit = env::var("BATCH_TIME_LIMIT_MS")
            .ok()
            .and_then(|val| val.parse::<u64>().ok())
            .map_or(DEFAULT_TIME_LIMIT, Duration::from_millis);
        let shutdown_policy = match env::var("BATCH_SHUTDOWN_POLICY") {
            Ok(val) => val.parse()?,
            Err(_) => ShutdownPolicy::default(),
        };

        let options = Self {
            message_limit,
            time_limit,
            shutdown_policy,
        };

        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.message_limit == 0 {
            return Err(Error::InvalidConfig(
                "Message limit must be greater than 0".to_string(),
            ));
        }

        if self.time_limit.is_zero() {
            return Err(Error::InvalidConfig(
                "Time limit must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
