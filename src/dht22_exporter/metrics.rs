// dht22-exporter - Temperature and humidity metrics exporter for Prometheus
//
// Copyright 2021-2022 Nick Pillitteri
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

use crate::sensor::{Reading, SensorError, TemperatureUnit};
use crate::summary::{DurationSummary, SummaryTimer};
use prometheus::core::{Collector, Desc};
use prometheus::proto::{Gauge as GaugeProto, Metric, MetricFamily, MetricType};
use prometheus::{Encoder, Gauge, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

pub const HUMIDITY_METRIC: &str = "dht22_humidity";
pub const DURATION_METRIC: &str = "gatheringduration";

/// Name of the temperature gauge for readings reported in `unit`.
pub fn temperature_metric(unit: TemperatureUnit) -> String {
    format!("dht22_temperature_{}", unit.as_label())
}

/// Latest successful reading, with temperature in the unit of the store.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Measurement {
    pub temperature: f64,
    pub humidity: f64,
}

/// Collector that emits temperature and humidity gauges from a single snapshot
/// of the latest measurement, so a scrape never mixes values from two readings.
/// Nothing is emitted until the first measurement is stored.
#[derive(Clone)]
struct MeasurementGauges {
    temperature: Desc,
    humidity: Desc,
    latest: Arc<RwLock<Option<Measurement>>>,
}

impl MeasurementGauges {
    fn new(unit: TemperatureUnit, latest: Arc<RwLock<Option<Measurement>>>) -> Result<Self, prometheus::Error> {
        let temperature = Desc::new(
            temperature_metric(unit),
            format!("The temperature in {}", unit.as_label()),
            Vec::new(),
            HashMap::new(),
        )?;
        let humidity = Desc::new(
            HUMIDITY_METRIC.to_owned(),
            "Relative humidity (0-100)".to_owned(),
            Vec::new(),
            HashMap::new(),
        )?;

        Ok(Self {
            temperature,
            humidity,
            latest,
        })
    }

    fn gauge(desc: &Desc, value: f64) -> MetricFamily {
        let mut gauge = GaugeProto::default();
        gauge.set_value(value);

        let mut metric = Metric::default();
        metric.set_gauge(gauge);

        let mut family = MetricFamily::default();
        family.set_name(desc.fq_name.clone());
        family.set_help(desc.help.clone());
        family.set_field_type(MetricType::GAUGE);
        family.mut_metric().push(metric);
        family
    }
}

impl Collector for MeasurementGauges {
    fn desc(&self) -> Vec<&Desc> {
        vec![&self.temperature, &self.humidity]
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let latest = *self.latest.read().unwrap_or_else(PoisonError::into_inner);

        match latest {
            Some(m) => vec![
                Self::gauge(&self.temperature, m.temperature),
                Self::gauge(&self.humidity, m.humidity),
            ],
            None => Vec::new(),
        }
    }
}

/// Error exposing Prometheus metrics in the text exposition format.
#[derive(Debug)]
pub enum ExpositionError {
    Encoding(&'static str, Box<dyn Error + Send + Sync + 'static>),
}

impl fmt::Display for ExpositionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpositionError::Encoding(msg, ref e) => write!(f, "{}: {}", msg, e),
        }
    }
}

impl Error for ExpositionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ExpositionError::Encoding(_, ref e) => Some(e.as_ref()),
        }
    }
}

/// Holder of the latest successful DHT22 reading and of metrics describing how
/// reads have gone so far.
///
/// Only the sampling loop writes to the store. The HTTP server reads it via the
/// Prometheus registry it owns, rendering fresh values for every scrape.
pub struct MeasurementStore {
    unit: TemperatureUnit,
    latest: Arc<RwLock<Option<Measurement>>>,
    durations: DurationSummary,
    last_read: Gauge,
    collections: IntCounter,
    errors: IntCounterVec,
    registry: Registry,
}

impl MeasurementStore {
    pub fn new(unit: TemperatureUnit) -> Result<Self, prometheus::Error> {
        let latest = Arc::new(RwLock::new(None));
        let gauges = MeasurementGauges::new(unit, latest.clone())?;
        let durations = DurationSummary::new(DURATION_METRIC, "The duration of data gatherings")?;
        let last_read = Gauge::new(
            "dht22_last_read_timestamp_seconds",
            "Timestamp of last successful read",
        )?;
        let collections = IntCounter::new("dht22_collections_total", "Number of attempted reads")?;
        let errors = IntCounterVec::new(
            Opts::new("dht22_errors_total", "Number of failed reads by type"),
            &["kind"],
        )?;

        let registry = Registry::new();
        registry.register(Box::new(gauges))?;
        registry.register(Box::new(durations.clone()))?;
        registry.register(Box::new(last_read.clone()))?;
        registry.register(Box::new(collections.clone()))?;
        registry.register(Box::new(errors.clone()))?;

        Ok(Self {
            unit,
            latest,
            durations,
            last_read,
            collections,
            errors,
            registry,
        })
    }

    pub fn unit(&self) -> TemperatureUnit {
        self.unit
    }

    /// The latest successful measurement, `None` until the sensor has been read
    /// successfully at least once.
    pub fn latest(&self) -> Option<Measurement> {
        *self.latest.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn durations(&self) -> &DurationSummary {
        &self.durations
    }

    /// Start timing a sampling attempt. The attempt is recorded when the timer is
    /// stopped or dropped.
    pub fn start_timer(&self) -> SummaryTimer<'_> {
        self.durations.start_timer()
    }

    /// Record the outcome of a sampling attempt.
    ///
    /// A successful reading replaces the stored measurement. A failure is logged
    /// and counted while the previous measurement is kept as is.
    pub fn update(&self, result: Result<Reading, SensorError>) {
        self.collections.inc();

        match result {
            Ok(reading) => {
                let measurement = Measurement {
                    temperature: self.unit.convert(reading.temperature),
                    humidity: reading.humidity.into(),
                };

                *self.latest.write().unwrap_or_else(PoisonError::into_inner) = Some(measurement);

                // If we can't get the number of seconds since the epoch, skip the update
                let _ = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| self.last_read.set(d.as_secs_f64()));

                tracing::debug!(
                    message = "stored sensor reading",
                    temperature = measurement.temperature,
                    humidity = measurement.humidity,
                    unit = self.unit.as_label()
                );
            }
            Err(e) => {
                self.errors.with_label_values(&[e.kind().as_label()]).inc();
                tracing::error!(message = "unable to read sensor for metric collection", error = %e);
            }
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Collect all metrics from the registry and encode them in the Prometheus text
    /// exposition format.
    pub fn encoded_text(&self) -> Result<Vec<u8>, ExpositionError> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        tracing::debug!(
            message = "encoding metric families to text exposition format",
            num_metrics = metric_families.len()
        );

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|e| ExpositionError::Encoding("unable to encode Prometheus metrics", Box::new(e)))
            .map(|_| buffer)
    }
}

impl fmt::Debug for MeasurementStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeasurementStore")
            .field("unit", &self.unit)
            .field("latest", &self.latest())
            .field("durations", &self.durations)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::{Measurement, MeasurementStore};
    use crate::sensor::test::{reading, timeout};
    use crate::sensor::TemperatureUnit;
    use std::time::Duration;

    fn text(store: &MeasurementStore) -> String {
        String::from_utf8(store.encoded_text().unwrap()).unwrap()
    }

    #[test]
    fn test_update_success_replaces_measurement() {
        let store = MeasurementStore::new(TemperatureUnit::Celsius).unwrap();
        store.update(Ok(reading(20.5, 40.0)));
        store.update(Ok(reading(21.0, 41.5)));

        assert_eq!(
            Some(Measurement {
                temperature: 21.0,
                humidity: 41.5
            }),
            store.latest()
        );
    }

    #[test]
    fn test_update_failure_keeps_last_success() {
        let store = MeasurementStore::new(TemperatureUnit::Celsius).unwrap();
        store.update(Ok(reading(20.5, 40.0)));
        store.update(Err(timeout()));

        assert_eq!(
            Some(Measurement {
                temperature: 20.5,
                humidity: 40.0
            }),
            store.latest()
        );
    }

    #[test]
    fn test_update_converts_to_fahrenheit() {
        let store = MeasurementStore::new(TemperatureUnit::Fahrenheit).unwrap();
        store.update(Ok(reading(100.0, 50.0)));

        assert_eq!(Some(212.0), store.latest().map(|m| m.temperature));
        assert!(text(&store).contains("dht22_temperature_fahrenheit 212"));
    }

    #[test]
    fn test_exposition_before_first_read() {
        let store = MeasurementStore::new(TemperatureUnit::Fahrenheit).unwrap();
        store.update(Err(timeout()));
        store.durations().observe(Duration::from_millis(100));

        let out = text(&store);
        assert!(store.latest().is_none());
        assert!(!out.contains("dht22_temperature_fahrenheit"));
        assert!(!out.contains("dht22_humidity"));
        assert!(out.contains("gatheringduration_count 1"));
        assert!(out.contains("dht22_errors_total{kind=\"timeout\"} 1"));
    }

    #[test]
    fn test_exposition_after_read() {
        let store = MeasurementStore::new(TemperatureUnit::Celsius).unwrap();
        store.update(Ok(reading(22.5, 55.5)));

        let out = text(&store);
        assert!(out.contains("# TYPE dht22_temperature_celsius gauge"));
        assert!(out.contains("dht22_temperature_celsius 22.5"));
        assert!(out.contains("dht22_humidity 55.5"));
        assert!(out.contains("# TYPE gatheringduration summary"));
        assert!(out.contains("dht22_collections_total 1"));
        assert!(!out.contains("dht22_last_read_timestamp_seconds 0\n"));
    }
}
