// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod logger;

use std::env;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use batch_consumer::{
    Batch, BatchConsumerFactory, BatchOptions, Consumer, Error, MessageContext, Probe,
    ProbeScope,
};

const DEFAULT_MESSAGE_COUNT: usize = 50;
const DEFAULT_INTERVAL_MS: u64 = 20;
// Every Nth message carries a payload of the wrong type.
const MALFORMED_EVERY: usize = 7;
const DRAIN_GRACE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
struct SensorReading {
    sensor: String,
    value: f64,
}

struct AverageConsumer;

#[async_trait]
impl Consumer<SensorReading> for AverageConsumer {
    async fn consume(&self, batch: &Batch<SensorReading>) -> anyhow::Result<()> {
        let readings = batch.messages();
        let total: f64 = readings.iter().map(|r| r.message().value).sum();
        #[allow(clippy::cast_precision_loss)]
        let average = total / readings.len().max(1) as f64;
        let sensors: Vec<&str> = readings.iter().map(|r| r.message().sensor.as_str()).collect();

        info!(
            batch_id = batch.id(),
            length = readings.len(),
            reason = ?batch.close_reason(),
            "Consumed batch, average reading {average:.2} from {sensors:?}"
        );
        Ok(())
    }
}

/// How the dispatched messages ended
#[derive(Debug, Default, PartialEq, Eq)]
struct Tally {
    consumed: usize,
    rejected: usize,
    // Arrived after dispose or belonged to a discarded batch.
    dropped: usize,
    failed: usize,
}

impl Tally {
    fn record(&mut self, result: Result<(), Error>) {
        match result {
            Ok(()) => self.consumed += 1,
            Err(Error::TypeMismatch { .. }) => self.rejected += 1,
            Err(Error::CollectorDisposed | Error::BatchDiscarded) => self.dropped += 1,
            Err(e) => {
                self.failed += 1;
                warn!("Message failed: {e}");
            }
        }
    }
}

#[tokio::main]
pub async fn main() {
    let log_level = env::var("BATCH_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(log_level).expect("could not parse log level in configuration"),
        )
        .event_format(logger::Formatter::new())
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let options = match BatchOptions::from_env() {
        Ok(options) => options,
        Err(e) => {
            error!("Invalid batch configuration: {e}");
            return;
        }
    };
    let message_count = env::var("DEMO_MESSAGE_COUNT")
        .ok()
        .and_then(|val| val.parse::<usize>().ok())
        .unwrap_or(DEFAULT_MESSAGE_COUNT);
    let interval = env::var("DEMO_INTERVAL_MS")
        .ok()
        .and_then(|val| val.parse::<u64>().ok())
        .map_or(Duration::from_millis(DEFAULT_INTERVAL_MS), Duration::from_millis);

    info!(
        message_limit = options.message_limit,
        time_limit = ?options.time_limit,
        shutdown_policy = ?options.shutdown_policy,
        "Starting batch consumer demo with {message_count} messages"
    );

    let factory =
        match BatchConsumerFactory::<SensorReading, _, _>::new(options, || AverageConsumer) {
            Ok(factory) => Arc::new(factory),
            Err(e) => {
                error!("Failed to create batch consumer: {e}");
                return;
            }
        };

    let cancel_token = CancellationToken::new();
    {
        let cancel_token = cancel_token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, shutting down");
                cancel_token.cancel();
            }
        });
    }

    let mut in_flight = JoinSet::new();
    for seq in 0..message_count {
        if cancel_token.is_cancelled() {
            break;
        }

        let context = if seq % MALFORMED_EVERY == MALFORMED_EVERY - 1 {
            MessageContext::new(format!("reading-{seq}"), format!("garbled payload {seq}"))
        } else {
            #[allow(clippy::cast_precision_loss)]
            let value = (seq % 10) as f64 * 1.5;
            MessageContext::new(
                format!("reading-{seq}"),
                SensorReading {
                    sensor: format!("sensor-{}", seq % 3),
                    value,
                },
            )
        };

        let factory = Arc::clone(&factory);
        in_flight.spawn(async move { factory.dispatch(context).await });

        tokio::select! {
            () = cancel_token.cancelled() => break,
            () = sleep(interval) => {}
        }
    }

    // Producing has stopped; let the last spawned dispatches reach their batch.
    sleep(DRAIN_GRACE).await;
    if let Err(e) = factory.dispose().await {
        error!("Failed to dispose batch consumer: {e}");
    }

    let mut tally = Tally::default();
    while let Some(result) = in_flight.join_next().await {
        match result {
            Ok(result) => tally.record(result),
            Err(e) => {
                tally.failed += 1;
                error!("Dispatch task failed: {e}");
            }
        }
    }

    let mut probe = ProbeScope::new("pipeline");
    factory.probe(&mut probe);
    info!(
        consumed = tally.consumed,
        rejected = tally.rejected,
        dropped = tally.dropped,
        failed = tally.failed,
        "Batch consumer demo finished: {}",
        probe.to_json()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_losses_are_not_failures() {
        let mut tally = Tally::default();
        tally.record(Ok(()));
        tally.record(Err(Error::CollectorDisposed));
        tally.record(Err(Error::BatchDiscarded));
        tally.record(Err(Error::TypeMismatch {
            expected: "SensorReading",
            actual: "String",
        }));
        tally.record(Err(Error::InvalidState("cannot append to a closed batch")));

        assert_eq!(
            tally,
            Tally {
                consumed: 1,
                rejected: 1,
                dropped: 2,
                failed: 1,
            }
        );
    }
}
