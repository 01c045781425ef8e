// dht22-exporter - Temperature and humidity metrics exporter for Prometheus
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use crate::metrics::MeasurementStore;
use crate::sensor::{SensorError, SensorErrorKind, SensorReader};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::{self, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Level};

/// Periodically read a sensor and record each outcome in a `MeasurementStore`.
///
/// The sensor is read once as soon as the scheduler starts and then every
/// `interval` until the shutdown token is cancelled. Failed reads are recorded
/// and otherwise ignored: there is no backoff and no limit on how many reads can
/// fail in a row.
pub struct Scheduler<R> {
    reader: Arc<Mutex<R>>,
    store: Arc<MeasurementStore>,
    interval: Duration,
    retries: u32,
}

impl<R> Scheduler<R>
where
    R: SensorReader,
{
    pub fn new(reader: R, store: Arc<MeasurementStore>, interval: Duration, retries: u32) -> Self {
        Self {
            reader: Arc::new(Mutex::new(reader)),
            store,
            interval,
            retries,
        }
    }

    /// Run the scheduler on its own task until `shutdown` is cancelled.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        task::spawn(self.run(shutdown))
    }

    /// Read the sensor, then alternate between waiting for the next interval and
    /// reading it again. Returns as soon as `shutdown` is cancelled while waiting.
    /// A read in progress is always allowed to finish.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            message = "starting sensor sampling",
            interval_secs = self.interval.as_secs_f64(),
            retries = self.retries
        );

        self.sample().await;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    tracing::info!("stopping sensor sampling");
                    return;
                }
                _ = tokio::time::sleep(self.interval) => {
                    self.sample().await;
                }
            }
        }
    }

    /// Perform a single timed read of the sensor and record the result.
    async fn sample(&self) {
        let timer = self.store.start_timer();
        let reader = self.reader.clone();
        let retries = self.retries;

        // Reading the DHT22 means busy-polling a GPIO pin for a few milliseconds,
        // longer when reads have to be retried, so do it on the blocking pool.
        let res = task::spawn_blocking(move || {
            let mut r = reader.lock().unwrap_or_else(PoisonError::into_inner);
            r.read_with_retry(retries)
        })
        .instrument(tracing::span!(Level::DEBUG, "sensor_read"))
        .await
        .unwrap_or_else(|e| {
            Err(SensorError::KindMsgCause(
                SensorErrorKind::Runtime,
                "sensor read task failed",
                Box::new(e),
            ))
        });

        let elapsed = timer.observe_duration();
        tracing::debug!(message = "sampling attempt finished", elapsed_secs = elapsed.as_secs_f64(), ok = res.is_ok());
        self.store.update(res);
    }
}
