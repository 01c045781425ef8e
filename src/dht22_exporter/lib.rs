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

//! Export DHT22 temperature and humidity sensor readings as Prometheus metrics.
//!
//! ## Features
//!
//! `dht22-exporter` reads temperature and humidity from a [DHT22 sensor](https://learn.adafruit.com/dht)
//! every ten seconds and exports the latest values as Prometheus metrics. It is meant
//! to run on a Raspberry PI. At startup it checks GitHub for a newer release and, unless
//! told not to, installs it and exits so that a supervisor can start the new version.
//!
//! The following metrics are exported:
//!
//! * `dht22_temperature_fahrenheit` - Degrees fahrenheit measured by the sensor.
//! * `dht22_humidity` - Relative humidity (from 0 to 100) measured by the sensor.
//! * `gatheringduration` - Summary of how long each attempt to read the sensor took, in seconds.
//! * `dht22_last_read_timestamp_seconds` - UNIX timestamp of the last successful read.
//! * `dht22_collections_total` - Total number of attempts to read the sensor.
//! * `dht22_errors_total` - Total errors by kind while trying to read the sensor.
//!
//! Temperature and humidity are only exported after the sensor has been read
//! successfully at least once.
//!
//! ## Build
//!
//! Since it's meant to be run on a Raspberry PI, you will likely need to cross-compile.
//!
//! ```text
//! rustup target add armv7-unknown-linux-musleabihf
//! cargo build --release --target armv7-unknown-linux-musleabihf
//! ```
//!
//! ## Run
//!
//! The sensor data line must be connected to a GPIO pin, named using BCM numbering
//! (`GPIO27`, or just `27`). The pin is picked with the `GPIO` environment variable
//! and defaults to `GPIO27`. Set `DISABLE_UPDATE=true` to only log when a newer release
//! is available instead of installing it.
//!
//! ```text
//! sudo GPIO=GPIO17 DISABLE_UPDATE=true /usr/local/bin/dht22-exporter
//! ```
//!
//! Metrics are exposed on port `8001` at `/metrics` and a liveness check at `/health`.
//! Sampling happens in the background, not in response to scrapes, so scraping more
//! often than every ten seconds has no benefit.
//!
//! ```yaml
//! scrape_configs:
//!   - job_name: dht22
//!     static_configs:
//!       - targets: ['example:8001']
//! ```
//!

pub mod config;
pub mod exporter;
pub mod http;
pub mod metrics;
pub mod scheduler;
pub mod sensor;
pub mod shutdown;
pub mod summary;
pub mod update;
