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

use clap::Parser;
use dht22_exporter::config::{self, Config};
use dht22_exporter::exporter::{Exporter, StartupError, StartupErrorKind};
use dht22_exporter::sensor;
use dht22_exporter::update::{self, GithubUpdater};
use semver::Version;
use std::process;
use tracing::Level;

const DEFAULT_LOG_LEVEL: Level = Level::INFO;

/// Expose temperature and humidity from a DHT22 sensor as Prometheus metrics
///
/// Read temperature and humidity from a DHT22 sensor connected to a GPIO pin of
/// the local machine, usually a Raspberry PI, every ten seconds and expose the
/// latest values as Prometheus metrics on port 8001. A newer release of this
/// program is installed at startup when one is available.
#[derive(Debug, Parser)]
#[clap(name = "dht22-exporter", version = clap::crate_version!())]
struct Dht22ExporterApplication {
    /// GPIO pin the DHT22 data line is connected to, using BCM numbering ('GPIO27' or '27')
    #[arg(long, env = "GPIO")]
    gpio: Option<String>,

    /// Only check for a newer release at startup, don't install it. Enabled by the
    /// value 'true'
    #[arg(
        long,
        env = "DISABLE_UPDATE",
        action = clap::ArgAction::Set,
        num_args = 0..=1,
        default_value = "false",
        default_missing_value = "true",
        value_parser = config::parse_switch
    )]
    disable_update: bool,

    /// Logging verbosity. Allowed values are 'trace', 'debug', 'info', 'warn', and 'error'
    /// (case insensitive)
    #[arg(long, default_value_t = DEFAULT_LOG_LEVEL)]
    log_level: Level,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let opts = Dht22ExporterApplication::parse();
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(opts.log_level)
            .finish(),
    )
    .expect("failed to set tracing subscriber");

    tracing::info!(
        message = "starting dht22-exporter",
        version = clap::crate_version!(),
        commit = option_env!("GIT_COMMIT").unwrap_or("unknown")
    );

    let config = Config::new(opts.gpio, opts.disable_update);

    match (Version::parse(clap::crate_version!()), GithubUpdater::new()) {
        (Ok(current), Ok(updater)) => {
            let outcome = update::check_for_update(&updater, config.update_mode(), &current, &config.repository).await;
            if outcome.requires_restart() {
                tracing::info!("exiting to run updated version");
                return Ok(());
            }
        }
        (Err(e), _) => {
            tracing::error!(message = "unable to parse running version, skipping update check", error = %e);
        }
        (_, Err(e)) => {
            tracing::error!(message = "unable to create updater, skipping update check", error = %e);
        }
    }

    let exporter = Exporter::start(&config, |pin| {
        let gpio = sensor::host_init()
            .map_err(|e| StartupError::KindMsgCause(StartupErrorKind::Gpio, "failed to initialize GPIO", Box::new(e)))?;
        sensor::new_sensor(&gpio, pin)
            .map_err(|e| StartupError::KindMsgCause(StartupErrorKind::Sensor, "failed to initialize sensor", Box::new(e)))
    })
    .unwrap_or_else(|e| {
        tracing::error!(message = "failed to start", stage = e.kind().as_label(), pin = %config.pin, error = %e);
        process::exit(1)
    });

    if let Err(e) = exporter.run().await {
        tracing::error!(message = "exporter failed", stage = e.kind().as_label(), error = %e);
        process::exit(1);
    }

    Ok(())
}
