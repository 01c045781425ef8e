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

use crate::sensor::core::{
    open_pin, DataPin, Humidity, Reading, SensorError, SensorErrorKind, SensorReader, TemperatureCelsius,
};
use rppal::gpio::{Gpio, Mode};
use std::fmt::{Debug, Formatter};
use std::thread;
use std::time::{Duration, Instant};

pub(crate) const MAX_PULSE_CYCLES: u32 = 32_000;
pub(crate) const FRAME_BITS: usize = 40;
pub(crate) const FRAME_BYTES: usize = FRAME_BITS / 8;

/// The DHT22 returns stale or garbage data when polled more often than this.
pub(crate) const MIN_READ_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
enum Level {
    Low,
    High,
}

/// Number of polling cycles the data pin spent low and then high while the
/// sensor transmitted a single bit.
#[derive(Debug, Clone, Copy, Default)]
struct Pulse {
    low: u32,
    high: u32,
}

/// Count how many polling cycles the pin stays at `level`, giving up once the count
/// reaches `MAX_PULSE_CYCLES`. Normal counts are in the low hundreds so hitting the
/// limit means the sensor stopped responding and the read has to be retried.
fn count_cycles(pin: &dyn DataPin, level: Level) -> Result<u32, SensorError> {
    let mut cycles = 0;

    loop {
        let at_level = match level {
            Level::Low => pin.is_low(),
            Level::High => pin.is_high(),
        };

        if !at_level {
            return Ok(cycles);
        }

        cycles += 1;
        if cycles >= MAX_PULSE_CYCLES {
            return Err(SensorError::KindMsg(
                SensorErrorKind::ReadTimeout,
                match level {
                    Level::Low => "timeout waiting for low pulse capture",
                    Level::High => "timeout waiting for high pulse capture",
                },
            ));
        }
    }
}

/// Capture the low/high pulses for all 40 bits of a frame.
///
/// The pin must already have been handed back to the sensor after the start signal.
fn capture(pin: &dyn DataPin) -> Result<[Pulse; FRAME_BITS], SensorError> {
    // The sensor acknowledges the start signal with one low/high pair before the
    // first data bit. It carries no data so the counts are discarded.
    count_cycles(pin, Level::Low)?;
    count_cycles(pin, Level::High)?;

    let mut pulses = [Pulse::default(); FRAME_BITS];
    for pulse in pulses.iter_mut() {
        pulse.low = count_cycles(pin, Level::Low)?;
        pulse.high = count_cycles(pin, Level::High)?;
    }

    tracing::trace!(message = "captured low/high pulse counts", pulses = ?pulses);
    Ok(pulses)
}

/// Five bytes sent by the sensor: two bytes of humidity, two bytes of temperature,
/// and a checksum. Only frames with a valid checksum can be constructed.
#[derive(Debug, PartialEq)]
struct Frame([u8; FRAME_BYTES]);

impl Frame {
    fn decode(pulses: &[Pulse; FRAME_BITS]) -> Result<Self, SensorError> {
        // Every bit starts with a low pulse of fixed length followed by a high pulse
        // that is shorter than it for a 0 and longer than it for a 1. The average low
        // pulse is the cut off between the two.
        let threshold = pulses.iter().map(|p| p.low).sum::<u32>() / FRAME_BITS as u32;
        let mut bytes = [0u8; FRAME_BYTES];

        for (i, pulse) in pulses.iter().enumerate() {
            if pulse.high >= threshold {
                bytes[i / 8] |= 0x80 >> (i % 8);
            }
        }

        Self::verify(bytes)
    }

    fn verify(bytes: [u8; FRAME_BYTES]) -> Result<Self, SensorError> {
        // From the DHT22 datasheet: the checksum is the last 8 bits of the sum of
        // the four data bytes.
        let expected = bytes[4];
        let computed = bytes[..4].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));

        tracing::debug!(
            message = "computing checksum for sensor data",
            computed = computed,
            expected = expected
        );

        if computed != expected {
            Err(SensorError::CheckSum(expected, computed))
        } else {
            Ok(Frame(bytes))
        }
    }

    fn humidity(&self) -> Humidity {
        let raw = u16::from_be_bytes([self.0[0], self.0[1]]);
        Humidity::from(f64::from(raw) / 10.0)
    }

    fn temperature(&self) -> TemperatureCelsius {
        // Highest bit is the sign, the remaining 15 bits are the magnitude * 10
        let raw = u16::from_be_bytes([self.0[2] & 0x7F, self.0[3]]);
        let magnitude = f64::from(raw) / 10.0;

        if self.0[2] & 0x80 != 0 {
            TemperatureCelsius::from(-magnitude)
        } else {
            TemperatureCelsius::from(magnitude)
        }
    }
}

impl From<Frame> for Reading {
    fn from(frame: Frame) -> Self {
        let reading = Reading {
            temperature: frame.temperature(),
            humidity: frame.humidity(),
        };

        tracing::debug!(
            message = "parsed sensor data",
            temperature = %reading.temperature,
            humidity = %reading.humidity
        );

        reading
    }
}

/// Read temperature in degrees celsius and relative humidity from a DHT22 sensor
pub struct DHT22Sensor {
    pin: Box<dyn DataPin + Send + Sync + 'static>,
    min_interval: Duration,
    last_read: Option<Instant>,
}

impl DHT22Sensor {
    pub fn from_pin<T>(pin: T) -> Self
    where
        T: DataPin + Send + Sync + 'static,
    {
        Self {
            pin: Box::new(pin),
            min_interval: MIN_READ_INTERVAL,
            last_read: None,
        }
    }

    /// Override how long to wait between consecutive reads of the sensor.
    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }

    /// Block until enough time has passed since the last read for the sensor to
    /// have a fresh measurement.
    fn pace(&self) {
        if let Some(last) = self.last_read {
            let elapsed = last.elapsed();
            if elapsed < self.min_interval {
                thread::sleep(self.min_interval - elapsed);
            }
        }
    }

    fn start_signal(&mut self) {
        // https://cdn-shop.adafruit.com/datasheets/Digital+humidity+and+temperature+sensor+AM2302.pdf
        // High to wake the sensor, low for at least 1ms so it notices, then high for
        // 20-40us before letting go of the line so it can respond.
        self.pin.set_mode(Mode::Output);
        self.pin.set_high();
        thread::sleep(Duration::from_millis(10));
        self.pin.set_low();
        thread::sleep(Duration::from_millis(20));
        self.pin.set_high();
        thread::sleep(Duration::from_micros(30));
        self.pin.set_mode(Mode::Input);
    }

    /// Read temperature and humidity from the sensor once or return an error with
    /// details about what caused the read to fail.
    pub fn read(&mut self) -> Result<Reading, SensorError> {
        self.pace();
        self.start_signal();
        let frame = capture(self.pin.as_ref()).and_then(|pulses| Frame::decode(&pulses));
        self.last_read = Some(Instant::now());
        frame.map(Reading::from)
    }
}

impl SensorReader for DHT22Sensor {
    fn read_with_retry(&mut self, retries: u32) -> Result<Reading, SensorError> {
        let mut attempt = 1;

        loop {
            match self.read() {
                Ok(reading) => return Ok(reading),
                Err(e) if attempt >= retries => return Err(e),
                Err(e) => {
                    tracing::debug!(message = "sensor read attempt failed", attempt = attempt, error = %e);
                    attempt += 1;
                }
            }
        }
    }
}

impl Debug for DHT22Sensor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DHT22Sensor")
            .field("pin", &self.pin.pin())
            .field("min_interval", &self.min_interval)
            .finish()
    }
}

/// Create a DHT22 sensor on the pin named by `name` (`GPIO27`, `27`, ...).
pub fn new_sensor(gpio: &Gpio, name: &str) -> Result<DHT22Sensor, SensorError> {
    open_pin(gpio, name).map(DHT22Sensor::from_pin)
}
