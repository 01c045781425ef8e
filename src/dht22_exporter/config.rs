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

use crate::sensor::TemperatureUnit;
use crate::update::UpdateMode;
use std::convert::Infallible;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

pub const DEFAULT_PIN: &str = "GPIO27";
pub const POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const RETRY_COUNT: u32 = 11;
pub const METRICS_PORT: u16 = 8001;
pub const DEFAULT_REPOSITORY: &str = "rtdev7690/dht22-exporter";

/// Settings for a single run of the exporter. Built once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub pin: String,
    pub poll_interval: Duration,
    pub retry_count: u32,
    pub metrics_port: u16,
    pub update_disabled: bool,
    pub units: TemperatureUnit,
    pub repository: String,
}

impl Config {
    /// Create a config using the given sensor pin, falling back to `DEFAULT_PIN`
    /// (with a warning) when it's missing or blank.
    pub fn new(pin: Option<String>, update_disabled: bool) -> Self {
        let pin = match pin.map(|p| p.trim().to_owned()) {
            Some(p) if !p.is_empty() => p,
            _ => {
                tracing::warn!(message = "sensor pin not set, using default", pin = DEFAULT_PIN);
                DEFAULT_PIN.to_owned()
            }
        };

        Config {
            pin,
            poll_interval: POLL_INTERVAL,
            retry_count: RETRY_COUNT,
            metrics_port: METRICS_PORT,
            update_disabled,
            units: TemperatureUnit::Fahrenheit,
            repository: DEFAULT_REPOSITORY.to_owned(),
        }
    }

    /// Address to serve metrics on, all interfaces.
    pub fn bind_addr(&self) -> SocketAddr {
        (Ipv4Addr::UNSPECIFIED, self.metrics_port).into()
    }

    pub fn update_mode(&self) -> UpdateMode {
        if self.update_disabled {
            UpdateMode::CheckOnly
        } else {
            UpdateMode::Apply
        }
    }
}

/// Parse an on/off switch from the environment or command line. Only the exact
/// value `true` turns it on, anything else leaves it off.
pub fn parse_switch(value: &str) -> Result<bool, Infallible> {
    Ok(value.trim() == "true")
}
