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

use std::error::Error;
use std::fmt::{self, Formatter};

use rppal::gpio::{Gpio, IoPin, Mode};

/// Temperature, in degrees celsius
#[derive(Copy, Clone, Debug, PartialEq)]
#[repr(transparent)]
pub struct TemperatureCelsius(f64);

impl From<TemperatureCelsius> for f64 {
    fn from(v: TemperatureCelsius) -> Self {
        v.0
    }
}

impl From<f64> for TemperatureCelsius {
    fn from(v: f64) -> Self {
        Self(v)
    }
}

impl fmt::Display for TemperatureCelsius {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}c", self.0)
    }
}

/// Relative humidity (from 0 to 100)
#[derive(Copy, Clone, Debug, PartialEq)]
#[repr(transparent)]
pub struct Humidity(f64);

impl From<Humidity> for f64 {
    fn from(v: Humidity) -> Self {
        v.0
    }
}

impl From<f64> for Humidity {
    fn from(v: f64) -> Self {
        Self(v)
    }
}

impl fmt::Display for Humidity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}

/// Unit temperatures are reported in once they leave the sensor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TemperatureUnit {
    Celsius,
    Fahrenheit,
}

impl TemperatureUnit {
    /// Convert a reading in degrees celsius to this unit.
    pub fn convert(&self, t: TemperatureCelsius) -> f64 {
        match self {
            TemperatureUnit::Celsius => t.0,
            TemperatureUnit::Fahrenheit => t.0 * 1.8 + 32.0,
        }
    }

    pub fn as_label(&self) -> &'static str {
        match self {
            TemperatureUnit::Celsius => "celsius",
            TemperatureUnit::Fahrenheit => "fahrenheit",
        }
    }
}

/// A single successful read of the sensor.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Reading {
    pub temperature: TemperatureCelsius,
    pub humidity: Humidity,
}

/// Potential kinds of errors that can be encountered reading from the DHT sensor
#[derive(PartialEq, Eq, Debug, Hash, Clone, Copy)]
pub enum SensorErrorKind {
    Initialization,
    ReadTimeout,
    Checksum,
    Runtime,
}

impl SensorErrorKind {
    pub fn as_label(&self) -> &'static str {
        match self {
            SensorErrorKind::Initialization => "initialization",
            SensorErrorKind::ReadTimeout => "timeout",
            SensorErrorKind::Checksum => "checksum",
            SensorErrorKind::Runtime => "runtime",
        }
    }
}

/// Error initializing or reading the DHT22 sensor via a GPIO pin
#[derive(Debug)]
pub enum SensorError {
    CheckSum(u8, u8),
    InvalidPin(String),
    KindMsg(SensorErrorKind, &'static str),
    KindMsgCause(SensorErrorKind, &'static str, Box<dyn Error + Send + Sync>),
}

impl SensorError {
    pub fn kind(&self) -> SensorErrorKind {
        match self {
            SensorError::CheckSum(_, _) => SensorErrorKind::Checksum,
            SensorError::InvalidPin(_) => SensorErrorKind::Initialization,
            SensorError::KindMsg(kind, _) => *kind,
            SensorError::KindMsgCause(kind, _, _) => *kind,
        }
    }
}

impl fmt::Display for SensorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SensorError::CheckSum(expected, got) => {
                write!(f, "checksum error: expected {}, got {}", expected, got)
            }
            SensorError::InvalidPin(name) => write!(f, "invalid GPIO pin identifier '{}'", name),
            SensorError::KindMsg(_, msg) => msg.fmt(f),
            SensorError::KindMsgCause(_, msg, ref e) => write!(f, "{}: {}", msg, e),
        }
    }
}

impl Error for SensorError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SensorError::KindMsgCause(_, _, ref e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

/// Anything that can produce a temperature and humidity reading, retrying
/// internally up to `retries` times before giving up.
///
/// Implementations are allowed to block: callers are expected to run them on a
/// thread where blocking is acceptable.
pub trait SensorReader: Send + 'static {
    fn read_with_retry(&mut self, retries: u32) -> Result<Reading, SensorError>;
}

/// Parse a pin identifier such as `GPIO27`, `gpio27`, or `27` into a BCM GPIO
/// pin number.
///
/// Note that the BCM GPIO pin number is NOT the same as the physical pin number.
/// See [pinout] for more information.
///
/// [pinout]: https://www.raspberrypi.com/documentation/computers/os.html#gpio-and-the-40-pin-header
pub fn parse_pin(name: &str) -> Result<u8, SensorError> {
    let trimmed = name.trim();
    let digits = match (trimmed.get(..4), trimmed.get(4..)) {
        (Some(prefix), Some(rest)) if prefix.eq_ignore_ascii_case("gpio") => rest,
        _ => trimmed,
    };

    digits
        .parse::<u8>()
        .map_err(|_| SensorError::InvalidPin(name.to_owned()))
}

/// Validate that the GPIO peripheral of this host is available.
///
/// This must succeed before any sensor can be created.
pub fn host_init() -> Result<Gpio, SensorError> {
    Gpio::new().map_err(|e| {
        SensorError::KindMsgCause(
            SensorErrorKind::Initialization,
            "unable to create GPIO controller",
            Box::new(e),
        )
    })
}

/// Acquire the pin named by `name` from the controller as an `IoPin`.
pub fn open_pin(gpio: &Gpio, name: &str) -> Result<IoPin, SensorError> {
    let bcm_gpio_pin = parse_pin(name)?;
    let pin = gpio.get(bcm_gpio_pin).map_err(|e| {
        SensorError::KindMsgCause(
            SensorErrorKind::Initialization,
            "unable to acquire pin from controller",
            Box::new(e),
        )
    })?;

    Ok(pin.into_io(Mode::Input))
}

/// Abstraction around an `rppal::gpio::IoPin` to allow for easier testing.
pub trait DataPin {
    fn is_low(&self) -> bool;
    fn is_high(&self) -> bool;
    fn pin(&self) -> u8;
    fn set_high(&mut self);
    fn set_low(&mut self);
    fn set_mode(&mut self, mode: Mode);
}

impl DataPin for IoPin {
    fn is_low(&self) -> bool {
        IoPin::is_low(self)
    }

    fn is_high(&self) -> bool {
        IoPin::is_high(self)
    }

    fn pin(&self) -> u8 {
        IoPin::pin(self)
    }

    fn set_high(&mut self) {
        IoPin::set_high(self);
    }

    fn set_low(&mut self) {
        IoPin::set_low(self);
    }

    fn set_mode(&mut self, mode: Mode) {
        IoPin::set_mode(self, mode);
    }
}
